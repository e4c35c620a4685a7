//! Main binary for the gpufleet agent daemon

use clap::{Parser, Subcommand};
use fleet_agent::{Agent, AgentConfig, Result};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "fleet-agentd")]
#[command(about = "gpufleet worker-node agent")]
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
        eprintln!("fleet-agentd: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match cli.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    fleet_core::init_logging(&config.logging);

    let agent = Agent::new(config);
    if let Err(e) = agent.run().await {
        error!("Agent failed: {}", e);
        return Err(e);
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    match output {
        Some(path) => {
            config.to_file(&path)?;
            println!("Generated configuration file: {}", path.display());
        }
        None => {
            let yaml = serde_yaml::to_string(&config)
                .map_err(|e| fleet_agent::Error::config(e.to_string()))?;
            println!("{}", yaml);
        }
    }

    Ok(())
}

fn validate_config(path: PathBuf) -> Result<()> {
    let config = AgentConfig::from_file(&path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("  Agent id:   {}", config.agent.id);
    println!("  Scheduler:  {}", config.scheduler.primary_addr);
    println!("  Detection:  {:?}", config.gpu.detection_method);
    println!("  Work dir:   {}", config.executor.work_dir.display());

    Ok(())
}
