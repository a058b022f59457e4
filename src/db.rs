//! Authoritative product database
//!
//! The database is the on-disk source of truth for product declarations.
//! Layout: one subdirectory per product, one `<version>.toml` file per
//! declared version, each holding one `[[declaration]]` entry per flavor:
//!
//! ```toml
//! [[declaration]]
//! flavor = "Linux64"
//! install_dir = "/opt/astro/1.0"
//! table_file = "/opt/astro/1.0/ups/astro.table"
//! tags = ["current"]
//! ```
//!
//! The stack treats this module as a collaborator: it enumerates product
//! names, loads declarations, and asks whether anything changed after a
//! given instant (the cache-freshness signal).

use crate::error::{UpstackError, UpstackResult};
use crate::product::Product;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

const VERSION_FILE_EXT: &str = "toml";

/// One per-flavor declaration inside a version file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Declaration {
    flavor: String,
    install_dir: Option<PathBuf>,
    table_file: Option<PathBuf>,
    #[serde(default)]
    tags: Vec<String>,
}

/// On-disk shape of a `<version>.toml` file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VersionFile {
    #[serde(rename = "declaration", default)]
    declarations: Vec<Declaration>,
}

/// Handle on a product database directory
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Open an existing database directory; fails fast if it is missing
    pub fn open(path: impl Into<PathBuf>) -> UpstackResult<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(UpstackError::DatabaseNotFound(path));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of all declared products, sorted
    pub fn product_names(&self) -> UpstackResult<Vec<String>> {
        let entries = fs::read_dir(&self.path)
            .map_err(|e| UpstackError::io(format!("reading database {}", self.path.display()), e))?;

        let mut names = vec![];
        for entry in entries {
            let entry =
                entry.map_err(|e| UpstackError::io("reading database entry", e))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// All declarations of one product, one Product per (version, flavor).
    /// An unknown product yields an empty list.
    pub fn products(&self, name: &str) -> UpstackResult<Vec<Product>> {
        let product_dir = self.path.join(name);
        if !product_dir.is_dir() {
            return Ok(vec![]);
        }

        let entries = fs::read_dir(&product_dir).map_err(|e| {
            UpstackError::io(format!("reading product directory {}", product_dir.display()), e)
        })?;

        let mut products = vec![];
        for entry in entries {
            let entry = entry.map_err(|e| UpstackError::io("reading version entry", e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != VERSION_FILE_EXT) {
                continue;
            }
            let Some(version) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let file = read_version_file(&path)?;
            for decl in file.declarations {
                if decl.flavor.is_empty() {
                    return Err(UpstackError::DeclarationInvalid {
                        path: path.clone(),
                        reason: "declaration missing flavor".to_string(),
                    });
                }
                products.push(Product {
                    name: name.to_string(),
                    version: version.to_string(),
                    flavor: decl.flavor,
                    install_dir: decl.install_dir,
                    table_file: decl.table_file,
                    table: None,
                    db: Some(self.path.clone()),
                    tags: decl.tags,
                });
            }
        }

        products.sort_by(|a, b| (&a.version, &a.flavor).cmp(&(&b.version, &b.flavor)));
        debug!("Loaded {} declarations for {}", products.len(), name);
        Ok(products)
    }

    /// Whether any declaration changed at or after the given instant.
    /// This signal is database-wide, not per flavor. Only product
    /// subdirectories are consulted: snapshot and lock files share the
    /// database directory by default and must not count as changes.
    pub fn is_newer_than(&self, since: SystemTime) -> UpstackResult<bool> {
        let entries = fs::read_dir(&self.path)
            .map_err(|e| UpstackError::io(format!("reading database {}", self.path.display()), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| UpstackError::io("reading database entry", e))?;
            let path = entry.path();
            if path.is_dir() && newest_under(&path, since)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Write a declaration for a product, creating or updating its version
    /// file. An existing declaration for the same flavor is replaced.
    pub fn declare(&self, product: &Product) -> UpstackResult<()> {
        if !product.is_fully_specified() {
            return Err(UpstackError::UnderSpecifiedProduct {
                name: product.name.clone(),
                version: product.version.clone(),
                flavor: product.flavor.clone(),
            });
        }

        let path = self.version_file_path(&product.name, &product.version);
        let mut file = if path.exists() {
            read_version_file(&path)?
        } else {
            VersionFile::default()
        };

        file.declarations.retain(|d| d.flavor != product.flavor);
        file.declarations.push(Declaration {
            flavor: product.flavor.clone(),
            install_dir: product.install_dir.clone(),
            table_file: product.table_file.clone(),
            tags: product.tags.clone(),
        });
        file.declarations.sort_by(|a, b| a.flavor.cmp(&b.flavor));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpstackError::io("creating product directory", e))?;
        }
        let content = toml::to_string_pretty(&file)?;
        fs::write(&path, content)
            .map_err(|e| UpstackError::io(format!("writing declaration {}", path.display()), e))?;

        debug!(
            "Declared {} {} for {}",
            product.name, product.version, product.flavor
        );
        Ok(())
    }

    /// Remove a declaration; returns false if nothing matched. Empty version
    /// files and product directories are removed.
    pub fn undeclare(&self, name: &str, version: &str, flavor: &str) -> UpstackResult<bool> {
        let path = self.version_file_path(name, version);
        if !path.exists() {
            return Ok(false);
        }

        let mut file = read_version_file(&path)?;
        let before = file.declarations.len();
        file.declarations.retain(|d| d.flavor != flavor);
        if file.declarations.len() == before {
            return Ok(false);
        }

        if file.declarations.is_empty() {
            fs::remove_file(&path).map_err(|e| {
                UpstackError::io(format!("removing declaration {}", path.display()), e)
            })?;
            let product_dir = self.path.join(name);
            // drop the product directory once its last version is gone
            if fs::read_dir(&product_dir)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false)
            {
                fs::remove_dir(&product_dir)
                    .map_err(|e| UpstackError::io("removing product directory", e))?;
            }
        } else {
            let content = toml::to_string_pretty(&file)?;
            fs::write(&path, content).map_err(|e| {
                UpstackError::io(format!("writing declaration {}", path.display()), e)
            })?;
        }
        Ok(true)
    }

    fn version_file_path(&self, name: &str, version: &str) -> PathBuf {
        self.path
            .join(name)
            .join(format!("{version}.{VERSION_FILE_EXT}"))
    }
}

fn read_version_file(path: &Path) -> UpstackResult<VersionFile> {
    let content = fs::read_to_string(path)
        .map_err(|e| UpstackError::io(format!("reading declaration {}", path.display()), e))?;
    toml::from_str(&content).map_err(|e| UpstackError::DeclarationInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn newest_under(dir: &Path, since: SystemTime) -> UpstackResult<bool> {
    let entries = fs::read_dir(dir)
        .map_err(|e| UpstackError::io(format!("reading directory {}", dir.display()), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| UpstackError::io("reading directory entry", e))?;
        let path = entry.path();
        if path.is_dir() {
            if newest_under(&path, since)? {
                return Ok(true);
            }
        } else {
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .map_err(|e| UpstackError::io(format!("stat {}", path.display()), e))?;
            if mtime >= since {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
