use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
}

/// An artifactory.toml file, merged on top of the built-in defaults.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Store namespace for every record. Also prefixes CI run names.
    pub namespace: String,
    pub registry: RegistryConfig,
    pub git: GitConfig,
    pub ci: CiConfig,
    pub dispatch: DispatchConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).expect("built-in default.toml")
    }
}

impl Config {
    /// Read a user configuration file and merge it with the built-in defaults.
    pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
        let user_config = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_string(),
        })?;
        Self::default_with_user_config(&user_config)
    }

    /// Keys present in `user_config` replace the defaults, tables are merged recursively.
    pub fn default_with_user_config(user_config: &str) -> Result<Self, Error> {
        let mut config: toml::Table = toml::from_str(DEFAULT_CONFIG)?;
        let overlay: toml::Table = toml::from_str(user_config)?;
        merge(&mut config, overlay);
        Ok(toml::Value::Table(config).try_into()?)
    }
}

fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(nested) if matches!(base.get(&key), Some(toml::Value::Table(_))) => {
                if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                    merge(existing, nested);
                }
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

/// Container registry (Harbor compatible) used to host built images.
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct RegistryConfig {
    pub scheme: String,
    #[serde_inline_default("/api/v2.0".to_string())]
    pub api_path: String,
    pub username: String,
    pub password: String,
    pub verify_tls: bool,
    pub timeout_secs: u64,
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Service-level credentials used when talking to the source control remote.
#[derive(Deserialize, Debug, Clone)]
pub struct GitConfig {
    pub scheme: String,
    pub username: String,
    pub password: String,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct CiConfig {
    /// Workflow endpoint accepting generated flow runs.
    pub endpoint: String,
    /// Action the CI executor runs for the single build step.
    pub action: String,
    /// Retry hint forwarded to the external executor, not honored here.
    #[serde_inline_default(15)]
    pub retry_count: u32,
    pub timeout_secs: u64,
}

impl CiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl DispatchConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
}

#[derive(Deserialize, Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub directory: PathBuf,
}
