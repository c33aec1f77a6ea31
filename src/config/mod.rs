//! Layered configuration: an optional config file, then environment
//! variables (`MQTTSOCKET__BROKER__PORT=1883`), then built-in defaults.

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, BusClientSettings, LogSettings, ServerSettings, Settings};

/// Base name of the config file looked up when none is given on the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

/// Loads the configuration using `path` as the (optional) file source.
///
/// `path` may carry an extension or be a base name resolved by the `config`
/// crate (`config/default` finds `config/default.toml`).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("MQTTSOCKET")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
