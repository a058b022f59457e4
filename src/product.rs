//! Product records
//!
//! A `Product` is one declared (name, version, flavor) unit together with
//! its install location and setup metadata. Records returned from stack
//! lookups are annotated with the flavor they were found under and the path
//! of the owning database.

use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One declared version of a product on one platform flavor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product name
    pub name: String,

    /// Version string
    pub version: String,

    /// Platform flavor this declaration targets
    pub flavor: String,

    /// Directory the product is installed into
    pub install_dir: Option<PathBuf>,

    /// Path to the product's table file
    pub table_file: Option<PathBuf>,

    /// Parsed table contents, if they have been loaded
    pub table: Option<Table>,

    /// Path of the database this product was looked up from
    pub db: Option<PathBuf>,

    /// Tags currently assigned to this version
    pub tags: Vec<String>,
}

impl Product {
    /// Create a product with just its identity fields
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        flavor: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            flavor: flavor.into(),
            ..Self::default()
        }
    }

    /// Whether name, version, and flavor are all present
    pub fn is_fully_specified(&self) -> bool {
        !self.name.is_empty() && !self.version.is_empty() && !self.flavor.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_specified() {
        assert!(Product::new("astro", "1.0", "Linux64").is_fully_specified());
        assert!(!Product::new("astro", "", "Linux64").is_fully_specified());
        assert!(!Product::new("", "1.0", "Linux64").is_fully_specified());
        assert!(!Product::new("astro", "1.0", "").is_fully_specified());
    }

    #[test]
    fn serialize_roundtrip() {
        let mut product = Product::new("astro", "1.0", "Linux64");
        product.install_dir = Some(PathBuf::from("/opt/astro/1.0"));
        product.tags = vec!["current".to_string()];

        let json = serde_json::to_string(&product).unwrap();
        let parsed: Product = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, product);
    }
}
