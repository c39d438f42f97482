//! Bridge configuration from `CODEX_`-prefixed environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::{ClientInfo, SupervisorConfig};
use crate::transport::ServerConfig;

pub const ENV_PREFIX: &str = "CODEX_";

#[derive(Debug, thiserror::Error)]
#[error("invalid {name}={value:?}: {reason}")]
pub struct ConfigError {
    pub name: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub codex_path: PathBuf,
    pub client_info: ClientInfo,
    pub host: String,
    pub port: u16,
    /// Default for calls, notification waits and tracked operations.
    pub request_timeout: Duration,
    pub initialization_timeout: Duration,
    /// `None` disables the health loop.
    pub health_check_interval: Option<Duration>,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            codex_path: PathBuf::from("codex"),
            client_info: ClientInfo::default(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_timeout: Duration::from_secs(300),
            initialization_timeout: Duration::from_secs(30),
            health_check_interval: Some(Duration::from_secs(5)),
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(path) = env.get("CODEX_PATH") {
            config.codex_path = PathBuf::from(path);
        }
        if let Some(name) = env.get("CLIENT_NAME") {
            config.client_info.name = name;
        }
        if let Some(title) = env.get("CLIENT_TITLE") {
            config.client_info.title = title;
        }
        if let Some(version) = env.get("CLIENT_VERSION") {
            config.client_info.version = version;
        }
        if let Some(host) = env.get("HOST") {
            config.host = host;
        }
        if let Some(port) = env.get("PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|e| env.invalid("PORT", &port, e))?;
        }
        if let Some(secs) = env.get("REQUEST_TIMEOUT") {
            config.request_timeout = env.positive_secs("REQUEST_TIMEOUT", &secs)?;
        }
        if let Some(secs) = env.get("INITIALIZATION_TIMEOUT") {
            config.initialization_timeout = env.positive_secs("INITIALIZATION_TIMEOUT", &secs)?;
        }
        if let Some(secs) = env.get("HEALTH_CHECK_INTERVAL") {
            let interval = env.secs("HEALTH_CHECK_INTERVAL", &secs)?;
            config.health_check_interval = (!interval.is_zero()).then_some(interval);
        }
        if let Some(level) = env.get("LOG_LEVEL") {
            let normalized = level.trim().to_ascii_lowercase();
            match normalized.as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => config.log_level = normalized,
                "warning" => config.log_level = "warn".to_string(),
                _ => return Err(env.invalid("LOG_LEVEL", &level, "unknown log level")),
            }
        }

        Ok(config)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig::default()
            .with_codex_path(self.codex_path.clone())
            .with_client_info(self.client_info.clone())
            .with_init_timeout(self.initialization_timeout)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Empty values count as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}")).filter(|v| !v.trim().is_empty())
    }

    fn invalid(&self, key: &str, value: &str, reason: impl ToString) -> ConfigError {
        ConfigError {
            name: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn secs(&self, key: &str, value: &str) -> Result<Duration, ConfigError> {
        let secs: f64 = value
            .trim()
            .parse()
            .map_err(|e| self.invalid(key, value, e))?;
        Duration::try_from_secs_f64(secs).map_err(|e| self.invalid(key, value, e))
    }

    fn positive_secs(&self, key: &str, value: &str) -> Result<Duration, ConfigError> {
        let duration = self.secs(key, value)?;
        if duration.is_zero() {
            return Err(self.invalid(key, value, "must be greater than zero"));
        }
        Ok(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<BridgeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.codex_path, PathBuf::from("codex"));
        assert_eq!(config.client_info.name, "codex-bridge-server");
        assert_eq!(config.client_info.title, "Codex Bridge Server");
        assert_eq!(config.port, 8000);
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.initialization_timeout, Duration::from_secs(30));
        assert_eq!(config.health_check_interval, Some(Duration::from_secs(5)));
    }

    #[test]
    fn reads_prefixed_variables() {
        let config = from_pairs(&[
            ("CODEX_CODEX_PATH", "/opt/codex/bin/codex"),
            ("CODEX_CLIENT_NAME", "my-bridge"),
            ("CODEX_CLIENT_VERSION", "9.9.9"),
            ("CODEX_HOST", "127.0.0.1"),
            ("CODEX_PORT", "9100"),
            ("CODEX_REQUEST_TIMEOUT", "12.5"),
            ("CODEX_INITIALIZATION_TIMEOUT", "3"),
            ("CODEX_LOG_LEVEL", "DEBUG"),
        ])
        .unwrap();

        assert_eq!(config.codex_path, PathBuf::from("/opt/codex/bin/codex"));
        assert_eq!(config.client_info.name, "my-bridge");
        assert_eq!(config.client_info.title, "Codex Bridge Server");
        assert_eq!(config.client_info.version, "9.9.9");
        assert_eq!(config.server_config().host, "127.0.0.1");
        assert_eq!(config.server_config().port, 9100);
        assert_eq!(config.request_timeout, Duration::from_millis(12_500));
        assert_eq!(config.initialization_timeout, Duration::from_secs(3));
        assert_eq!(config.log_level, "debug");

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.codex_path, config.codex_path);
        assert_eq!(supervisor.init_timeout, Duration::from_secs(3));
    }

    #[test]
    fn zero_interval_disables_health_loop() {
        let config = from_pairs(&[("CODEX_HEALTH_CHECK_INTERVAL", "0")]).unwrap();
        assert_eq!(config.health_check_interval, None);
    }

    #[test]
    fn empty_value_keeps_default() {
        let config = from_pairs(&[("CODEX_PORT", "")]).unwrap();
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = from_pairs(&[("CODEX_PORT", "eighty")]).unwrap_err();
        assert_eq!(err.name, "CODEX_PORT");
        assert!(err.to_string().starts_with("invalid CODEX_PORT=\"eighty\""));

        let err = from_pairs(&[("CODEX_REQUEST_TIMEOUT", "-1")]).unwrap_err();
        assert_eq!(err.name, "CODEX_REQUEST_TIMEOUT");

        let err = from_pairs(&[("CODEX_INITIALIZATION_TIMEOUT", "0")]).unwrap_err();
        assert_eq!(err.reason, "must be greater than zero");

        let err = from_pairs(&[("CODEX_LOG_LEVEL", "loud")]).unwrap_err();
        assert_eq!(err.name, "CODEX_LOG_LEVEL");
    }
}
