//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Session credentials are never read from the TOML; they come from the
//! credential file or the `SESSION_ACCESS_TOKEN` / `SESSION_REFRESH_TOKEN`
//! env vars.

use common::Secret;
use serde::Deserialize;
use session_auth::DEFAULT_REFRESH_PATH;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_listen_addr")]
    pub admin_listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Business API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

/// Where the session credentials live
#[derive(Debug, Default, Deserialize)]
pub struct SessionConfig {
    /// JSON credential file. Without one the session lives in memory only.
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
    #[serde(skip)]
    pub seed: Option<SessionSeed>,
}

/// Credential pair supplied through the environment.
#[derive(Debug)]
pub struct SessionSeed {
    pub access: Secret<String>,
    pub refresh: Secret<String>,
}

fn default_admin_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    1000
}

fn default_refresh_path() -> String {
    DEFAULT_REFRESH_PATH.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_refresh_timeout() -> u64 {
    30
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// `SESSION_ACCESS_TOKEN` and `SESSION_REFRESH_TOKEN` must be set together;
    /// a lone one is a configuration error.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.session.seed = session_seed_from_env()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if !self.api.refresh_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "refresh_path must start with '/', got: {}",
                self.api.refresh_path
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.api.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.gateway.listen_addr == self.gateway.admin_listen_addr {
            return Err(common::Error::Config(format!(
                "admin_listen_addr must differ from listen_addr ({})",
                self.gateway.listen_addr
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("bizdesk-api-gateway.toml")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn session_seed_from_env() -> common::Result<Option<SessionSeed>> {
    match (
        non_empty_env("SESSION_ACCESS_TOKEN"),
        non_empty_env("SESSION_REFRESH_TOKEN"),
    ) {
        (Some(access), Some(refresh)) => Ok(Some(SessionSeed {
            access: Secret::new(access),
            refresh: Secret::new(refresh),
        })),
        (None, None) => Ok(None),
        _ => Err(common::Error::Config(
            "SESSION_ACCESS_TOKEN and SESSION_REFRESH_TOKEN must be set together".into(),
        )),
    }
}
