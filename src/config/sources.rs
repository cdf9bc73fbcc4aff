use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "BULWARK_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/bulwark.toml";
const ENV_PREFIX: &str = "BULWARK";
const ENV_SEPARATOR: &str = "__";

/// Path of the TOML file: `BULWARK_CONFIG` or the default location
pub fn config_path() -> PathBuf {
    env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    load_from(config_path())
}

/// Same layering as [`load`], rooted at an explicit TOML file
pub fn load_from(config_path: PathBuf) -> Result<Config, ConfigError> {
    load_with_env_file(config_path, None)
}

/// Layered load with an explicit `.env` file
///
/// `None` searches the working directory and its parents. Variables that
/// are already set in the process environment are not overwritten.
pub fn load_with_env_file(
    config_path: PathBuf,
    env_file: Option<&Path>,
) -> Result<Config, ConfigError> {
    // a missing .env is fine
    let _ = match env_file {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    load_from_sources(config_path)
}

/// Load configuration from a specific path and environment
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // BULWARK__JOBS__WORKERS -> jobs.workers
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}
