use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the gateway.
///
/// Includes the HTTP/WebSocket server, the embedded bus broker, the bus
/// client used by WebSocket sessions and logging.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub bus_client: BusClientSettings,
    pub log: LogSettings,
}

/// Configuration settings for the HTTP/WebSocket server.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Time granted to in-flight requests after a stop signal.
    pub shutdown_grace_secs: u64,
}

impl ServerSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Configuration settings for the embedded bus broker.
///
/// Immutable once the broker is started.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Interface to bind. Empty means every interface.
    pub host: String,
    pub port: u16,
    /// Communication timeout in milliseconds.
    pub timeout_ms: u64,
    pub username: String,
    pub password: String,
    /// Listen backlog and cap on concurrently connected bus clients.
    pub max_connections: usize,
}

impl BrokerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Address the listener binds to.
    pub fn bind_address(&self) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        format!("{host}:{}", self.port)
    }
}

/// Configuration settings for the bus client shared by all sessions.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusClientSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub timeout_ms: u64,
    pub username: String,
    pub password: String,
}

impl BusClientSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub bus_client: Option<PartialBusClientSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout_ms: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBusClientSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Merge with defaults. The bus client inherits the broker port,
    /// timeout and credentials unless it names its own port.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let bus_client = self.bus_client.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        let broker = BrokerSettings {
            host: broker.host.unwrap_or(default.broker.host),
            port: broker.port.unwrap_or(default.broker.port),
            timeout_ms: broker.timeout_ms.unwrap_or(default.broker.timeout_ms),
            username: broker.username.unwrap_or(default.broker.username),
            password: broker.password.unwrap_or(default.broker.password),
            max_connections: broker
                .max_connections
                .unwrap_or(default.broker.max_connections),
        };

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                shutdown_grace_secs: server
                    .shutdown_grace_secs
                    .unwrap_or(default.server.shutdown_grace_secs),
            },
            bus_client: BusClientSettings {
                host: bus_client.host.unwrap_or(default.bus_client.host),
                port: bus_client.port.unwrap_or(broker.port),
                client_id: bus_client.client_id.unwrap_or(default.bus_client.client_id),
                keep_alive_secs: bus_client
                    .keep_alive_secs
                    .unwrap_or(default.bus_client.keep_alive_secs),
                timeout_ms: broker.timeout_ms,
                username: broker.username.clone(),
                password: broker.password.clone(),
            },
            broker,
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                shutdown_grace_secs: 5,
            },
            broker: BrokerSettings {
                host: String::new(),
                port: 61613,
                timeout_ms: 5000,
                username: String::new(),
                password: String::new(),
                max_connections: 100,
            },
            bus_client: BusClientSettings {
                host: "127.0.0.1".to_string(),
                port: 61613,
                client_id: "websocketServer".to_string(),
                keep_alive_secs: 30,
                timeout_ms: 5000,
                username: String::new(),
                password: String::new(),
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
