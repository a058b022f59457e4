//! Product families
//!
//! A `ProductFamily` owns every declared version of one product within one
//! flavor, along with the tag assignments made within that (flavor, product)
//! pair. Families are the values at the bottom of the stack's lookup
//! hierarchy and the unit serialized into per-flavor snapshot files.

use crate::error::{UpstackError, UpstackResult};
use crate::product::Product;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Prefix marking a tag as user-scoped; anything else is a global tag
pub const USER_TAG_PREFIX: &str = "user.";

/// Whether a tag name is user-scoped
pub fn is_user_tag(tag: &str) -> bool {
    tag.starts_with(USER_TAG_PREFIX)
}

/// Per-version metadata held by a family
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Directory the version is installed into
    pub install_dir: Option<PathBuf>,

    /// Path to the version's table file
    pub table_file: Option<PathBuf>,

    /// Parsed table contents, once loaded
    pub table: Option<Table>,
}

/// All versions and tag assignments of one product within one flavor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFamily {
    /// Product name
    name: String,

    /// version -> metadata; BTreeMap keeps versions in sorted order
    versions: BTreeMap<String, VersionInfo>,

    /// tag -> version; at most one version per tag, last assignment wins
    tags: BTreeMap<String, String>,
}

impl ProductFamily {
    /// Create an empty family for a product name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add or overwrite a version entry
    pub fn add_version(&mut self, version: impl Into<String>, info: VersionInfo) {
        self.versions.insert(version.into(), info);
    }

    /// Remove a version, dropping any tags that pointed at it.
    /// Returns false if the version was not declared.
    pub fn remove_version(&mut self, version: &str) -> bool {
        if self.versions.remove(version).is_none() {
            return false;
        }
        self.tags.retain(|_, v| v != version);
        true
    }

    /// Declared versions, sorted
    pub fn versions(&self) -> Vec<String> {
        self.versions.keys().cloned().collect()
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Assemble the Product record for a version, annotated with the given
    /// database path and flavor
    pub fn product(&self, version: &str, db: &Path, flavor: &str) -> Option<Product> {
        let info = self.versions.get(version)?;
        Some(Product {
            name: self.name.clone(),
            version: version.to_string(),
            flavor: flavor.to_string(),
            install_dir: info.install_dir.clone(),
            table_file: info.table_file.clone(),
            table: info.table.clone(),
            db: Some(db.to_path_buf()),
            tags: self.tags_for(version),
        })
    }

    /// All tags assigned within this family, sorted
    pub fn tags(&self) -> Vec<String> {
        self.tags.keys().cloned().collect()
    }

    /// Tags currently pointing at one version, sorted
    fn tags_for(&self, version: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, v)| v.as_str() == version)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Assign a tag to a declared version; fails if the version is unknown
    pub fn assign_tag(&mut self, tag: impl Into<String>, version: &str) -> UpstackResult<()> {
        if !self.has_version(version) {
            return Err(UpstackError::ProductNotFound {
                name: self.name.clone(),
                version: Some(version.to_string()),
                flavor: None,
            });
        }
        self.tags.insert(tag.into(), version.to_string());
        Ok(())
    }

    /// Remove a tag assignment; returns false if the tag was not assigned
    pub fn unassign_tag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag).is_some()
    }

    /// The version carrying a tag, if any
    pub fn tagged_version(&self, tag: &str) -> Option<&str> {
        self.tags.get(tag).map(String::as_str)
    }

    /// The Product carrying a tag, if any
    pub fn tagged_product(&self, tag: &str, db: &Path, flavor: &str) -> Option<Product> {
        let version = self.tags.get(tag)?.clone();
        self.product(&version, db, flavor)
    }

    /// Cache a parsed table for a declared version; returns false if the
    /// version is unknown
    pub fn load_table_for(&mut self, version: &str, table: Table) -> bool {
        match self.versions.get_mut(version) {
            Some(info) => {
                info.table = Some(table);
                true
            }
            None => false,
        }
    }

    /// Copy of this family with user-scoped tags stripped, for writing into
    /// the shared global snapshot. User tags are persisted through the
    /// per-(flavor, tag) overlay files instead.
    pub fn global_snapshot(&self) -> Self {
        let mut out = self.clone();
        out.tags.retain(|tag, _| !is_user_tag(tag));
        out
    }

    /// Export every version as a full Product record, keyed by version
    pub fn export(&self, db: &Path, flavor: &str) -> BTreeMap<String, Product> {
        self.versions
            .keys()
            .filter_map(|v| self.product(v, db, flavor).map(|p| (v.clone(), p)))
            .collect()
    }

    /// Merge exported Product records into this family, overwriting any
    /// versions already present and re-applying their tags
    pub fn import(&mut self, products: &BTreeMap<String, Product>) {
        for (version, product) in products {
            self.add_version(
                version.clone(),
                VersionInfo {
                    install_dir: product.install_dir.clone(),
                    table_file: product.table_file.clone(),
                    table: product.table.clone(),
                },
            );
            for tag in &product.tags {
                self.tags.insert(tag.clone(), version.clone());
            }
        }
    }
}
