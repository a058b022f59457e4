//! Table-file parsing
//!
//! A table file carries the setup metadata for one version of a product:
//! environment directives, dependency declarations, and the like. The stack
//! only caches the parsed directive list alongside the version entry; it
//! never interprets the directives itself.

use crate::error::{UpstackError, UpstackResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Parsed contents of a table file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Setup directives, one per non-comment line, in file order
    pub directives: Vec<String>,
}

impl Table {
    /// Parse table text, dropping blank lines and `#` comments
    pub fn parse(text: &str) -> Self {
        let directives = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self { directives }
    }

    /// Parse a table file from disk
    pub fn from_file(path: &Path) -> UpstackResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| UpstackError::io(format!("reading table file {}", path.display()), e))?;
        Ok(Self::parse(&text))
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}
