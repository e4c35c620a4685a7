//! Main binary for the gpufleet scheduler daemon

use clap::{Parser, Subcommand};
use fleet_scheduler::{Result, Scheduler, SchedulerConfig};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "fleet-schedulerd")]
#[command(about = "Centralized scheduler for a fleet of GPU nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the default configuration
    Config {
        /// Output file path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Config { output }) => generate_config(output),
        Some(Commands::Validate { config }) => validate_config(config),
        None => run(cli).await,
    };

    if let Err(e) = result {
        eprintln!("fleet-schedulerd: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match cli.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };

    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    fleet_core::init_logging(&config.logging);

    let scheduler = Scheduler::new(config).await?;
    if let Err(e) = scheduler.run().await {
        error!("Scheduler failed: {}", e);
        return Err(e);
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = SchedulerConfig::default();

    match output {
        Some(path) => {
            config.to_file(&path)?;
            println!("Generated configuration file: {}", path.display());
        }
        None => {
            let yaml = serde_yaml::to_string(&config)
                .map_err(|e| fleet_core::Error::config(e.to_string()))?;
            println!("{}", yaml);
        }
    }

    Ok(())
}

fn validate_config(path: PathBuf) -> Result<()> {
    let config = SchedulerConfig::from_file(&path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("  Scheduler id: {}", config.scheduler_id);
    println!("  Role:         {}", config.scheduling.role);
    println!("  Agent RPC:    {}", config.server.grpc_addr);
    println!("  REST API:     {}", config.server.http_addr);
    println!("  Snapshots:    {}", config.storage.snapshot_dir.display());

    Ok(())
}
