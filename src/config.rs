//! Recognized configuration options (spec §6). There are no mandatory
//! environment variables; everything arrives through this struct, loaded
//! from JSON or YAML by `main`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

fn default_registry_prefix() -> String {
    "meshgate:".to_string()
}

fn default_http_version() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This process's own app name. Empty means "not a service."
    #[serde(default)]
    pub app: String,
    /// This process's own routing weight. 0 means "not a service."
    #[serde(default)]
    pub weight: u32,
    /// Address (host:port) this process advertises to peers.
    #[serde(default)]
    pub addr: String,
    /// Address of the directory (KV+pubsub) backend, e.g. `redis://127.0.0.1:6379`.
    pub registry: String,
    #[serde(default = "default_registry_prefix")]
    pub registry_prefix: String,
    /// Apps this process calls as a client, keyed by app name.
    #[serde(default)]
    pub calls: HashMap<String, AppConfig>,
    /// Credential -> granted auth level.
    #[serde(default)]
    pub access_tokens: HashMap<String, u32>,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub log_response_size: usize,
    #[serde(default)]
    pub no_log_headers: HashSet<String>,
    /// Header name carrying the session id. Defaults to `S-Session-Id`.
    #[serde(default = "default_session_header")]
    pub session_header: String,
    /// Address this process's own HTTP/WS server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_session_header() -> String {
    "S-Session-Id".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_http_version")]
    pub http_version: u8,
}

impl Config {
    pub fn is_service(&self) -> bool {
        !self.app.is_empty() && self.weight > 0
    }

    pub fn is_client(&self) -> bool {
        !self.calls.is_empty()
    }

    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.is_service() && self.app.trim().is_empty() {
            return Err(crate::error::ConfigError::MissingAppName);
        }
        Ok(())
    }

    pub fn channel_for(&self, app: &str) -> String {
        format!("{}CH_{}", self.registry_prefix, app)
    }

    pub fn key_for(&self, app: &str) -> String {
        format!("{}{}", self.registry_prefix, app)
    }

    /// Load a config from a JSON or YAML file, sniffed by extension.
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::error::ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str_sniffed(&raw, path.extension().and_then(|e| e.to_str()))
    }

    pub fn from_str_sniffed(
        raw: &str,
        extension: Option<&str>,
    ) -> Result<Self, crate::error::ConfigError> {
        let looks_yaml = matches!(extension, Some("yaml") | Some("yml"));
        if looks_yaml {
            serde_yaml::from_str(raw).map_err(|e| crate::error::ConfigError::Parse(e.to_string()))
        } else {
            serde_json::from_str(raw)
                .or_else(|_| serde_yaml::from_str(raw))
                .map_err(|e| crate::error::ConfigError::Parse(e.to_string()))
        }
    }
}

#[cfg(test)]
mod config_test {
    use super::*;

    #[test]
    fn service_requires_app_and_weight() {
        let mut cfg = Config {
            app: "checkout".into(),
            weight: 0,
            ..blank()
        };
        assert!(!cfg.is_service());
        cfg.weight = 1;
        assert!(cfg.is_service());
    }

    #[test]
    fn client_requires_nonempty_calls() {
        let mut cfg = blank();
        assert!(!cfg.is_client());
        cfg.calls.insert("billing".into(), AppConfig::default());
        assert!(cfg.is_client());
    }

    #[test]
    fn channel_and_key_use_prefix() {
        let cfg = blank();
        assert_eq!(cfg.channel_for("billing"), "meshgate:CH_billing");
        assert_eq!(cfg.key_for("billing"), "meshgate:billing");
    }

    fn blank() -> Config {
        Config {
            app: String::new(),
            weight: 0,
            addr: String::new(),
            registry: "redis://localhost".into(),
            registry_prefix: default_registry_prefix(),
            calls: HashMap::new(),
            access_tokens: HashMap::new(),
            compress: false,
            log_response_size: 0,
            no_log_headers: HashSet::new(),
            session_header: default_session_header(),
            listen_addr: default_listen_addr(),
        }
    }
}
