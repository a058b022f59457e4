//! Configuration for upstack
//!
//! Two layers: `Settings` is the user-facing TOML file (plus CLI overrides),
//! and `StackConfig` is the validated bundle a `ProductStack` is constructed
//! from. Validation is strict at construction time: missing directories are
//! errors, never silently tolerated.

use crate::error::{UpstackError, UpstackResult};
use crate::flavor::FallbackPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

/// User-facing settings, loaded from `config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub flavor: FlavorSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Product database directory
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Directory for per-flavor snapshot files; defaults to the database
    /// directory when unset
    pub dir: Option<PathBuf>,

    /// Directory for per-user tag overlay files
    pub user_tag_dir: Option<PathBuf>,

    /// Persist every mutation as it happens
    pub autosave: bool,

    /// How long to wait on a contended cache lock
    pub lock_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            user_tag_dir: None,
            autosave: true,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlavorSettings {
    /// Override the detected native flavor
    pub native: Option<String>,

    /// Fallback flavors consulted after the native one
    pub fallbacks: Option<Vec<String>>,
}

impl Settings {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("upstack")
            .join("config.toml")
    }

    /// Default directory for user tag overlays
    pub fn default_user_tag_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("upstack")
            .join("usertags")
    }

    /// Load settings from a file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> UpstackResult<Self> {
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| UpstackError::io(format!("reading config from {}", path.display()), e))?;
        toml::from_str(&content).map_err(|e| UpstackError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// The fallback policy these settings describe
    pub fn fallback_policy(&self) -> FallbackPolicy {
        match &self.flavor.fallbacks {
            Some(fallbacks) => FallbackPolicy::new(fallbacks.clone()),
            None => FallbackPolicy::default(),
        }
    }
}

/// Validated configuration a `ProductStack` is built from
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Product database directory (the source of truth)
    pub db_path: PathBuf,

    /// Snapshot directory; the database directory is used when unset
    pub persist_dir: Option<PathBuf>,

    /// User tag overlay directory; user tags are not persisted when unset
    pub user_tag_dir: Option<PathBuf>,

    /// Persist every mutation as it happens
    pub autosave: bool,

    /// How long to wait on a contended cache lock
    pub lock_timeout: Duration,
}

impl StackConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            persist_dir: None,
            user_tag_dir: None,
            autosave: true,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
        }
    }

    pub fn persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    pub fn user_tag_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_tag_dir = Some(dir.into());
        self
    }

    pub fn autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Fail fast on directories that must already exist
    pub fn validate(&self) -> UpstackResult<()> {
        if !self.db_path.is_dir() {
            return Err(UpstackError::DatabaseNotFound(self.db_path.clone()));
        }
        if self.autosave {
            if let Some(dir) = &self.persist_dir {
                if !dir.is_dir() {
                    return Err(UpstackError::CacheDirNotFound(dir.clone()));
                }
            }
            if let Some(dir) = &self.user_tag_dir {
                if !dir.is_dir() {
                    return Err(UpstackError::UserTagDirNotFound(dir.clone()));
                }
            }
        }
        Ok(())
    }

    /// Build a validated config from settings plus CLI overrides
    pub fn from_settings(
        settings: &Settings,
        db_override: Option<PathBuf>,
    ) -> UpstackResult<Self> {
        let db_path = db_override
            .or_else(|| settings.database.path.clone())
            .ok_or_else(|| UpstackError::DatabaseNotFound(PathBuf::from("<unset>")))?;

        let user_tag_dir = settings
            .cache
            .user_tag_dir
            .clone()
            .unwrap_or_else(Settings::default_user_tag_dir);
        fs::create_dir_all(&user_tag_dir)
            .map_err(|e| UpstackError::io("creating user tag directory", e))?;

        let mut config = Self::new(db_path)
            .user_tag_dir(user_tag_dir)
            .autosave(settings.cache.autosave)
            .lock_timeout(Duration::from_millis(settings.cache.lock_timeout_ms));
        if let Some(dir) = &settings.cache.dir {
            fs::create_dir_all(dir)
                .map_err(|e| UpstackError::io("creating cache directory", e))?;
            config = config.persist_dir(dir.clone());
        }
        config.validate()?;
        Ok(config)
    }
}
