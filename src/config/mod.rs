//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if a value is present but malformed.
//! The store password is wrapped in secrecy::SecretString to prevent log leaks.

use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};

#[derive(Debug)]
pub struct Config {
    pub store: StoreConfig,
    pub http: HttpConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Where the backing store lives.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same parsing as [`Config::from_env`] over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            store: StoreConfig {
                host: var("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_port("REDIS_PORT", var("REDIS_PORT"), 6379)?,
                password: var("REDIS_PASSWORD").map(SecretString::from),
            },
            http: HttpConfig {
                host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_port("PORT", var("PORT"), 8080)?,
            },
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

impl StoreConfig {
    /// Connection URL, `redis://[:password@]host:port`.
    pub fn url(&self) -> SecretString {
        let url = match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}",
                password.expose_secret(),
                self.host,
                self.port
            ),
            None => format!("redis://{}:{}", self.host, self.port),
        };
        SecretString::from(url)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
        }
    }
}

fn parse_port(name: &str, value: Option<String>, default: u16) -> Result<u16> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be a port number, got {raw:?}"))),
    }
}
