//! Server configuration loaded from the environment: every setting has a
//! default and can be overridden by an env var, never by a config file
//! (only the router's model list is file-backed, via
//! `novaadapt_providers::ModelRouter`).

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Recognized server options, each with the documented default.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub api_token: Option<String>,
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    pub trusted_proxies: Vec<String>,
    pub max_body_bytes: usize,
    pub idempotency_ttl: Duration,
    pub audit_ttl: Duration,
    pub cleanup_interval: Duration,
    pub otel_enabled: bool,
    pub otel_service_name: String,
    pub otel_exporter_endpoint: Option<String>,
    pub state_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8787,
            api_token: None,
            rate_limit_rps: 0,
            rate_limit_burst: 0,
            trusted_proxies: Vec::new(),
            max_body_bytes: 1024 * 1024,
            idempotency_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            audit_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60),
            otel_enabled: false,
            otel_service_name: "novaadapt-engine".to_string(),
            otel_exporter_endpoint: None,
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NOVAADAPT_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    crate::db::default_state_dir()
}

impl ServerConfig {
    /// Starts from defaults and overlays any `NOVAADAPT_*` env vars that
    /// are set and parse cleanly; a malformed value is ignored rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let mut config = ServerConfig::default();

        if let Some(host) = env_parse::<IpAddr>("NOVAADAPT_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("NOVAADAPT_PORT") {
            config.port = port;
        }
        if let Ok(token) = std::env::var("NOVAADAPT_API_TOKEN") {
            if !token.trim().is_empty() {
                config.api_token = Some(token);
            }
        }
        if let Some(rps) = env_parse::<u32>("NOVAADAPT_RATE_LIMIT_RPS") {
            config.rate_limit_rps = rps;
        }
        if let Some(burst) = env_parse::<u32>("NOVAADAPT_RATE_LIMIT_BURST") {
            config.rate_limit_burst = burst;
        }
        if let Ok(proxies) = std::env::var("NOVAADAPT_TRUSTED_PROXIES") {
            config.trusted_proxies = proxies
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(bytes) = env_parse::<usize>("NOVAADAPT_MAX_BODY_BYTES") {
            config.max_body_bytes = bytes;
        }
        if let Some(secs) = env_parse::<u64>("NOVAADAPT_IDEMPOTENCY_TTL_SECONDS") {
            config.idempotency_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("NOVAADAPT_AUDIT_TTL_SECONDS") {
            config.audit_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("NOVAADAPT_CLEANUP_INTERVAL_SECONDS") {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_parse::<bool>("NOVAADAPT_OTEL_ENABLED") {
            config.otel_enabled = enabled;
        }
        if let Ok(name) = std::env::var("NOVAADAPT_OTEL_SERVICE_NAME") {
            if !name.trim().is_empty() {
                config.otel_service_name = name;
            }
        }
        if let Ok(endpoint) = std::env::var("NOVAADAPT_OTEL_EXPORTER_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                config.otel_exporter_endpoint = Some(endpoint);
            }
        }
        if let Ok(dir) = std::env::var("NOVAADAPT_STATE_DIR") {
            if !dir.trim().is_empty() {
                config.state_dir = PathBuf::from(dir);
            }
        }

        config
    }

    pub fn plans_db_path(&self) -> PathBuf {
        self.state_dir.join("plans.db")
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.state_dir.join("jobs.db")
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.state_dir.join("audit.db")
    }

    pub fn idempotency_db_path(&self) -> PathBuf {
        self.state_dir.join("idempotency.db")
    }

    pub fn action_log_db_path(&self) -> PathBuf {
        self.state_dir.join("actions.db")
    }

    pub fn models_config_path(&self) -> PathBuf {
        self.state_dir.join("models.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8787);
        assert_eq!(config.rate_limit_rps, 0);
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.idempotency_ttl, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.audit_ttl, Duration::from_secs(30 * 24 * 60 * 60));
    }

    #[test]
    fn env_parse_ignores_malformed_values() {
        std::env::set_var("NOVAADAPT_TEST_PORT_BOGUS", "not-a-number");
        assert_eq!(env_parse::<u16>("NOVAADAPT_TEST_PORT_BOGUS"), None);
        std::env::remove_var("NOVAADAPT_TEST_PORT_BOGUS");
    }
}
