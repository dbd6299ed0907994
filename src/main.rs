use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use corral::config::Config;
use corral::server;

#[derive(Debug, Parser)]
#[command(
    name = "corral",
    version,
    about = "Control plane for containerised AI agent sandboxes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control plane server.
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err:?}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Serve => {
            if let Err(err) = server::run(config).await {
                eprintln!("{err:?}");
                std::process::exit(1);
            }
        }
    }
}
