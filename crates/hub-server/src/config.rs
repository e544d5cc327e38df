//! Server configuration: a `config`-crate layered source (defaults, an
//! optional TOML file, then `HUB_` prefixed environment overrides).

use serde::Deserialize;

/// Top-level settings, deserialized from the layered config source.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// HTTP bind address/port.
    pub server: ServerConfig,
    /// Scheduler cron expressions (§4.8).
    pub schedule: ScheduleConfig,
    /// Tracing/log output configuration.
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
}

/// Cron schedules forwarded into `hub_core::HubSchedule`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Hourly compaction + retention sweep.
    pub aggregation_cron: String,
    /// Six-hour metric-source re-probe.
    pub reprobe_cron: String,
}

/// Tracing subscriber configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing-subscriber` env-filter directive, e.g. `"hub_core=debug,info"`.
    pub filter: String,
    /// Directory to write a rolling log file into, if set.
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_owned(),
                port: 8080,
            },
            schedule: ScheduleConfig {
                aggregation_cron: "0 0 * * * *".to_owned(),
                reprobe_cron: "0 0 */6 * * *".to_owned(),
            },
            logging: LoggingConfig {
                filter: "info".to_owned(),
                dir: None,
            },
        }
    }
}

impl Settings {
    /// Load settings from (in ascending priority) built-in defaults, an
    /// optional `hub.toml` in the working directory, and `HUB_`-prefixed
    /// environment variables (e.g. `HUB_SERVER__PORT=9090`).
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Settings::default();
        let figure = config::Config::builder()
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", defaults.server.port as i64)?
            .set_default("schedule.aggregation_cron", defaults.schedule.aggregation_cron)?
            .set_default("schedule.reprobe_cron", defaults.schedule.reprobe_cron)?
            .set_default("logging.filter", defaults.logging.filter)?
            .add_source(config::File::with_name("hub").required(false))
            .add_source(config::Environment::with_prefix("HUB").separator("__"))
            .build()?;
        Ok(figure.try_deserialize()?)
    }
}
