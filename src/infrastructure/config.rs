// Configuration loading - optional file layered under DASHBOARD_SYNC_* environment variables
use crate::application::backoff::BackoffPolicy;
use crate::application::connection_manager::{ConnectionSettings, Endpoint};
use serde::Deserialize;
use std::time::Duration;

pub const ENV_PREFIX: &str = "DASHBOARD_SYNC";

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub realtime: RealtimeSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RealtimeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub endpoint: Option<String>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffSettings,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            backoff: BackoffSettings::default(),
        }
    }
}

impl RealtimeSettings {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            endpoint: Endpoint::resolve(self.enabled, self.endpoint.as_deref()),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(1)),
            backoff: self.backoff.policy(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffSettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffSettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub token: Option<String>,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_api_timeout_ms() -> u64 {
    10_000
}

pub fn load_sync_config() -> anyhow::Result<SyncConfig> {
    let settings = builder(config::Environment::with_prefix(ENV_PREFIX)).build()?;

    Ok(settings.try_deserialize()?)
}

fn builder(environment: config::Environment) -> config::ConfigBuilder<config::builder::DefaultState> {
    config::Config::builder()
        .add_source(config::File::with_name("config/sync").required(false))
        .add_source(
            environment
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<SyncConfig> {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let environment = config::Environment::with_prefix(ENV_PREFIX).source(Some(source));

        Ok(builder(environment).build()?.try_deserialize()?)
    }

    #[test]
    fn test_defaults_with_only_api_base_url() {
        let config = load(&[("DASHBOARD_SYNC_API__BASE_URL", "http://localhost:3000/api")]).unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.api.timeout(), Duration::from_secs(10));
        assert!(config.realtime.enabled);
        assert_eq!(config.realtime.connection_settings().endpoint, Endpoint::Disabled);
        assert_eq!(config.realtime.backoff.policy(), BackoffPolicy::default());
    }

    #[test]
    fn test_environment_overrides_realtime_section() {
        let config = load(&[
            ("DASHBOARD_SYNC_API__BASE_URL", "http://localhost:3000/api"),
            ("DASHBOARD_SYNC_REALTIME__ENDPOINT", "wss://events.example.com/ws"),
            ("DASHBOARD_SYNC_REALTIME__HEARTBEAT_INTERVAL_MS", "5000"),
            ("DASHBOARD_SYNC_REALTIME__BACKOFF__MAX_ATTEMPTS", "2"),
        ])
        .unwrap();

        let settings = config.realtime.connection_settings();
        assert!(matches!(settings.endpoint, Endpoint::Ready(ref url) if url.host_str() == Some("events.example.com")));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(settings.backoff.max_attempts, 2);
    }

    #[test]
    fn test_disabled_flag_wins_over_endpoint() {
        let config = load(&[
            ("DASHBOARD_SYNC_API__BASE_URL", "http://localhost:3000/api"),
            ("DASHBOARD_SYNC_REALTIME__ENABLED", "false"),
            ("DASHBOARD_SYNC_REALTIME__ENDPOINT", "ws://localhost:9000"),
        ])
        .unwrap();

        assert_eq!(config.realtime.connection_settings().endpoint, Endpoint::Disabled);
    }

    #[test]
    fn test_missing_api_base_url_is_an_error() {
        assert!(load(&[]).is_err());
    }
}
