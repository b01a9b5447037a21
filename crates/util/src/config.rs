use std::{env, fmt, net::SocketAddr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://comments.db?mode=rwc";
pub const DEFAULT_IDM_URL: &str = "http://127.0.0.1:8090/";
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when logs should be human readable rather than JSON.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development | Self::Test)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    /// Base url of the identity management service, always ending with `/`.
    pub idm_url: String,
    pub notify_timeout: Duration,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url = non_empty_var("DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let mut idm_url = non_empty_var("IDM_URL").unwrap_or_else(|| DEFAULT_IDM_URL.to_string());
        if !idm_url.starts_with("http://") && !idm_url.starts_with("https://") {
            return Err(ConfigError::InvalidIdmUrl(idm_url));
        }
        if !idm_url.ends_with('/') {
            idm_url.push('/');
        }

        let notify_timeout = match non_empty_var("NOTIFY_TIMEOUT_SECS") {
            None => Duration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS),
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::InvalidNotifyTimeout(raw)),
            },
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            idm_url,
            notify_timeout,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidIdmUrl(String),
    InvalidNotifyTimeout(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidIdmUrl(value) => {
                write!(f, "IDM_URL must be an http(s) url (got {value})")
            }
            Self::InvalidNotifyTimeout(value) => write!(
                f,
                "NOTIFY_TIMEOUT_SECS must be a positive number of seconds (got {value})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
