use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bulwark")]
#[command(about = "Bulwark resilience and background work engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine and its operator HTTP API
    Serve(ServeArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to (overrides server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,

    /// Configuration file (defaults to $BULWARK_CONFIG or config/bulwark.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ConfigArgs {
    /// Configuration file (defaults to $BULWARK_CONFIG or config/bulwark.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from(["bulwark", "serve", "--address", "127.0.0.1:9000"]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.address, Some("127.0.0.1:9000".parse().unwrap()));
                assert!(args.config.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_config() {
        let cli = Cli::parse_from(["bulwark", "config", "--config", "custom.toml"]);
        assert!(matches!(cli.command, Commands::Config(ConfigArgs { config: Some(_) })));
    }
}
