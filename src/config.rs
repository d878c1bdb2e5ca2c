use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::Deserialize;
use std::str::FromStr;

pub const PROJECT_CONFIG_FILENAME: &str = "omnihistory.toml";
pub const HOME_CONFIG_DIR: &str = ".omnihistory";
pub const HOME_CONFIG_FILENAME: &str = "config.toml";
const DEFAULT_LISTEN: &str = "127.0.0.1:8000";
const DEFAULT_DB_PATH: &str = "omnihistory.db";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Config {
    /// Resolves the config file: an explicit path wins, then `./omnihistory.toml`, then
    /// `~/.omnihistory/config.toml`. With no file anywhere the built-in defaults apply.
    pub fn load(explicit_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_path(path);
        }

        let project_path = PathBuf::from(PROJECT_CONFIG_FILENAME);
        if project_path.is_file() {
            return Self::from_path(project_path);
        }

        if let Some(home) = env::var_os("HOME") {
            let home_path = PathBuf::from(home)
                .join(HOME_CONFIG_DIR)
                .join(HOME_CONFIG_FILENAME);
            if home_path.is_file() {
                return Self::from_path(home_path);
            }
        }

        Self::from_toml_str("")
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)
            .with_context(|| format!("load config {}", path.display()))?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn apply_overrides(&mut self, listen: Option<SocketAddr>, db_path: Option<&Path>) {
        if let Some(listen) = listen {
            self.server.listen = listen;
        }
        if let Some(db_path) = db_path {
            self.storage.path = db_path.to_path_buf();
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8000)))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}
