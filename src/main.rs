use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use blob_nfs::inspect;

#[derive(Parser)]
#[command(version, about = "Inspect a blob-nfs store")]
struct Cli {
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Inspect a fjall store offline
    Inspect {
        #[arg(long, default_value = ".")]
        meta_root: PathBuf,

        #[arg(long, default_value = "nfs")]
        domain: String,

        #[command(subcommand)]
        command: InspectCommand,
    },

    /// Parse a stack configuration file and print it
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum InspectCommand {
    /// Number of metadata records and chunks
    NumKeys,
    DiskSpace,
    /// List the blobs of a volume
    Ls {
        volume: String,
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Print the metadata of a blob
    Stat { volume: String, blob: String },
    /// Write the contents of a blob to stdout
    Cat {
        volume: String,
        blob: String,
        #[arg(long, default_value = "1048576")]
        object_size: usize,
    },
    /// Print the value of a persistent counter, or of every key it has
    Counter { name: String, key: Option<String> },
}

fn setup_tracing(log_level: &str) {
    // RUST_LOG wins over the flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", log_level);
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    setup_tracing(&cli.log_level);

    match cli.command {
        Command::Inspect {
            meta_root,
            domain,
            command,
        } => match command {
            InspectCommand::NumKeys => {
                let (metadata, objects) = inspect::num_keys(&meta_root)?;
                println!("Metadata records: {metadata}");
                println!("Chunks: {objects}");
            }
            InspectCommand::DiskSpace => {
                let disk_space = inspect::disk_space(&meta_root)?;
                println!("Disk space: {disk_space}");
            }
            InspectCommand::Ls { volume, prefix } => {
                inspect::list_blobs(&meta_root, &domain, &volume, &prefix).await?;
            }
            InspectCommand::Stat { volume, blob } => {
                inspect::stat_blob(&meta_root, &domain, &volume, &blob).await?;
            }
            InspectCommand::Cat {
                volume,
                blob,
                object_size,
            } => {
                inspect::cat_blob(&meta_root, &domain, &volume, &blob, object_size).await?;
            }
            InspectCommand::Counter {
                name,
                key: Some(key),
            } => {
                let value = inspect::counter_value(&meta_root, &domain, &name, &key).await?;
                println!("{name}[{key}] = {value}");
            }
            InspectCommand::Counter { name, key: None } => {
                for (key, value) in inspect::counter_values(&meta_root, &domain, &name).await? {
                    println!("{name}[{key}] = {value}");
                }
            }
        },
        Command::CheckConfig { config } => inspect::check_config(&config)?,
    }
    Ok(())
}
