//! Error types for upstack
//!
//! All modules use `UpstackResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for upstack operations
pub type UpstackResult<T> = Result<T, UpstackError>;

/// All errors that can occur in upstack
#[derive(Error, Debug)]
pub enum UpstackError {
    // Lookup errors
    #[error("Product not found: {name} {version} ({flavor})", version = .version.as_deref().unwrap_or("any"), flavor = .flavor.as_deref().unwrap_or("any flavor"))]
    ProductNotFound {
        name: String,
        version: Option<String>,
        flavor: Option<String>,
    },

    #[error("Product not fully specified: name={name:?} version={version:?} flavor={flavor:?}")]
    UnderSpecifiedProduct {
        name: String,
        version: String,
        flavor: String,
    },

    // Configuration errors
    #[error("Product database directory not found: {0}")]
    DatabaseNotFound(PathBuf),

    #[error("Cache directory not found: {0}")]
    CacheDirNotFound(PathBuf),

    #[error("User tag directory not found: {0}")]
    UserTagDirNotFound(PathBuf),

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // Database errors
    #[error("Malformed product declaration {path}: {reason}")]
    DeclarationInvalid { path: PathBuf, reason: String },

    // Cache-consistency errors
    #[error("In-memory cache out of sync with cache files: {}", format_paths(.files))]
    CacheOutOfSync { files: Vec<PathBuf> },

    #[error("At least one flavor is required to load from cache")]
    NoFlavorsRequested,

    // Locking errors
    #[error("Timed out acquiring lock on {path} after {waited_ms} ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl UpstackError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a fully-specified lookup failure
    pub fn product_not_found(
        name: impl Into<String>,
        version: impl Into<String>,
        flavor: impl Into<String>,
    ) -> Self {
        Self::ProductNotFound {
            name: name.into(),
            version: Some(version.into()),
            flavor: Some(flavor.into()),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::DatabaseNotFound(_) => {
                Some("Point --db (or UPSTACK_DB) at an existing product database directory")
            }
            Self::CacheOutOfSync { .. } => {
                Some("Another process updated the cache; run: upstack cache rebuild")
            }
            Self::LockTimeout { .. } => Some("Another upstack process holds the cache lock"),
            _ => None,
        }
    }
}
