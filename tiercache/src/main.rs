use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tiercache::{CacheConfig, LogFormat, Metadata, TierCache};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tiercache")]
#[command(about = "Inspect and manage an on-disk tier cache", version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache root directory (overrides config)
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// Disk capacity in bytes (overrides config)
    #[arg(long)]
    capacity: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value
    Put {
        key: String,
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        value: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print or save a value
    Get {
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove one or more keys
    Remove {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Remove every entry
    Clear,
    /// Trim the disk tier down to its configured target
    Sweep,
    /// Show disk usage
    Stats,
    /// Entry metadata
    Meta {
        #[command(subcommand)]
        command: MetaCommand,
    },
}

#[derive(Subcommand, Debug)]
enum MetaCommand {
    Get { key: String },
    /// Set one metadata value (JSON)
    Set { key: String, name: String, value: String },
    Remove { key: String },
}

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(directory) = &args.directory {
        config.disk.directory = directory.clone();
    }
    if let Some(capacity) = args.capacity {
        config.disk.capacity_bytes = capacity;
    }
    // One-shot process: no periodic sweeps
    config.cleanup.enabled = false;
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &CacheConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config);

    info!("Starting tiercache v{}", env!("CARGO_PKG_VERSION"));

    let cache: TierCache<Vec<u8>> = config.builder::<Vec<u8>>().without_memory().build()?;
    let mut failures = cache.subscribe_failures();

    match args.command {
        Command::Put { key, value, file } => {
            let data = match (value, file) {
                (Some(value), _) => value.into_bytes(),
                (None, Some(file)) => fs::read(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?,
                (None, None) => bail!("either --value or --file is required"),
            };
            let size = data.len();
            cache.put_data(&key, data.clone(), size as u64, data);
            cache.flush().await?;
            println!("stored {} ({} bytes)", key, size);
        }
        Command::Get { key, output } => {
            let Some(data) = cache.get(&key, Some, |v| v.len() as u64).await else {
                bail!("key not found: {}", key);
            };
            match output {
                Some(path) => {
                    fs::write(&path, &data)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("wrote {} bytes to {}", data.len(), path.display());
                }
                None => println!("{}", String::from_utf8_lossy(&data)),
            }
        }
        Command::Remove { keys } => {
            cache.remove_many(&keys);
            cache.flush().await?;
            println!("removed {} key(s)", keys.len());
        }
        Command::Clear => {
            cache.remove_all();
            cache.flush().await?;
            println!("cleared {}", cache.root().display());
        }
        Command::Sweep => {
            let report = cache.sweep_now().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let stats = cache.disk_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Meta { command } => match command {
            MetaCommand::Get { key } => match cache.metadata(&key).await {
                Some(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
                None => bail!("no entry for key: {}", key),
            },
            MetaCommand::Set { key, name, value } => {
                if !cache.contains(&key).await? {
                    bail!("no entry for key: {}", key);
                }
                let value: serde_json::Value = serde_json::from_str(&value)
                    .with_context(|| format!("metadata value is not JSON: {}", value))?;
                let mut values = Metadata::new();
                values.insert(name, value);
                cache.merge_metadata(&key, values);
                cache.flush().await?;
            }
            MetaCommand::Remove { key } => {
                cache.remove_metadata(&key);
                cache.flush().await?;
            }
        },
    }

    if let Ok(failure) = failures.try_recv() {
        bail!(
            "{:?} failed for {}: {}",
            failure.operation,
            failure.key.as_deref().unwrap_or("<all>"),
            failure.error
        );
    }

    Ok(())
}
