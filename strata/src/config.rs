//! Configuration management
//!
//! Sources, lowest precedence first: built-in defaults, `strata.toml` (or the
//! file passed with `--config`), `STRATA_*` environment variables with `__`
//! between nested keys (`STRATA_SERVER__PORT=9001`), then command line flags.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::Deserialize;
use strata_auth::SigningScope;
use strata_s3::S3Config;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_service")]
    pub service: String,

    /// `0` disables the check
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,

    /// Trust the raw `Authorization` header as an access key. Never in production.
    #[serde(default)]
    pub insecure_bypass_signatures: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            service: default_service(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
            insecure_bypass_signatures: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_max_body_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_region() -> String {
    strata_auth::sigv4::DEFAULT_REGION.to_string()
}

fn default_service() -> String {
    strata_auth::sigv4::DEFAULT_SERVICE.to_string()
}

fn default_max_clock_skew_secs() -> u64 {
    900
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("strata").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("STRATA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize::<Config>()?)
    }

    pub fn scope(&self) -> SigningScope {
        SigningScope::new(&self.auth.region, &self.auth.service)
    }

    pub fn s3_config(&self) -> S3Config {
        let max_skew = match self.auth.max_clock_skew_secs {
            0 => None,
            secs => Some(Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))),
        };

        S3Config {
            data_dir: self.storage.data_dir.clone(),
            scope: self.scope(),
            max_skew,
            bypass_signatures: self.auth.insecure_bypass_signatures,
        }
    }
}
