mod cli;

use bulwark::config::Config;
use bulwark::observability;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::PathBuf;

type AnyError = Box<dyn std::error::Error + Send + Sync>;

fn load_config(path: Option<PathBuf>) -> Result<Config, AnyError> {
    let config = match path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = load_config(args.config)?;
            observability::init_tracing(&config.telemetry);
            bulwark::api::run(config, args.address).await?
        }
        Commands::Config(args) => {
            let config = load_config(args.config)?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
