use std::path::{Path, PathBuf};

use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::semantic::{BackendKind, DEFAULT_MODEL, DEFAULT_TOP_K};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_DOCS_FOLDER: &str = "data/docs";
const DEFAULT_CACHE_FILE: &str = "embeddings.bin";
const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Overrides the base directory holding config, cache and models
pub const BASE_PATH_ENV: &str = "DOCSEARCH_BASE_PATH";
/// Overrides `docs_folder`
pub const DOCS_FOLDER_ENV: &str = "DOCS_FOLDER";
/// Overrides the cache file location
pub const CACHE_PATH_ENV: &str = "EMB_CACHE_DB";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("couldn't find home directory")]
    NoHome,

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Embedding model settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Seconds allowed for model download plus load before startup fails
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Preferred nearest-neighbor backend; brute force is used when it is
    /// not available in this build
    #[serde(default)]
    pub backend: BackendKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_docs_folder() -> String {
    DEFAULT_DOCS_FOLDER.to_string()
}

fn default_cache_file() -> String {
    DEFAULT_CACHE_FILE.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Folder scanned for `.txt` documents
    #[serde(default = "default_docs_folder")]
    pub docs_folder: String,

    /// Embedding cache file, relative to the base path unless absolute
    #[serde(default = "default_cache_file")]
    pub cache_file: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docs_folder: default_docs_folder(),
            cache_file: default_cache_file(),
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
            server: ServerConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.search.default_top_k == 0 {
            return Err(ConfigError::Invalid(
                "search.default_top_k must be at least 1".to_string(),
            ));
        }

        if self.embedding.download_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "embedding.download_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.embedding.model.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "embedding.model must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Base directory from `DOCSEARCH_BASE_PATH`, else `~/.local/share/docsearch`.
    pub fn default_base_path() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(BASE_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }

        let home = my_home()
            .map_err(|_| ConfigError::NoHome)?
            .ok_or(ConfigError::NoHome)?;
        Ok(home.join(".local").join("share").join("docsearch"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(&Self::default_base_path()?)
    }

    /// Load `config.yaml` from `base_path`, writing defaults if it is missing.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(base_path)?;
        let config_path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !config_path.exists() {
            let mut config = Self::default();
            config.base_path = base_path.to_path_buf();
            config.save()?;
        }

        let config_str = std::fs::read_to_string(&config_path)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.base_path.join(CONFIG_FILE);
        let temp_path = path.with_extension("yaml.tmp");

        std::fs::write(&temp_path, serde_yml::to_string(&self)?)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Documents folder, honouring `DOCS_FOLDER`.
    pub fn docs_folder_path(&self) -> PathBuf {
        std::env::var(DOCS_FOLDER_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(&self.docs_folder))
    }

    /// Cache file location, honouring `EMB_CACHE_DB`.
    pub fn cache_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var(CACHE_PATH_ENV) {
            return PathBuf::from(path);
        }
        self.base_path.join(&self.cache_file)
    }
}
