//! Configuration management for the IP guard service.
//!
//! Configuration is layered: built-in defaults, then an optional file named by
//! `CONFIG_FILE`, then `GUARD__`-prefixed environment variables
//! (e.g. `GUARD__RATE_LIMIT__FAILURE_POLICY=closed`).

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use std::env;

use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::with_prefix("GUARD").separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .build()?;

    config.try_deserialize()
}
