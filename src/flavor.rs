//! Platform flavor detection and fallback resolution
//!
//! A flavor names the platform a product build targets (`Linux64`,
//! `DarwinArm64`, ...). Fallbacks let a stack serve products declared for a
//! more generic flavor when the native one has no match. The fallback list
//! is plain configuration owned by the caller, not process-global state.

use serde::{Deserialize, Serialize};

/// The flavor of the host this process is running on
pub fn native_flavor() -> String {
    flavor_for(std::env::consts::OS, std::env::consts::ARCH)
}

fn flavor_for(os: &str, arch: &str) -> String {
    match (os, arch) {
        ("linux", "x86_64") => "Linux64".to_string(),
        ("linux", "aarch64") => "LinuxArm64".to_string(),
        ("macos", "x86_64") => "Darwin64".to_string(),
        ("macos", "aarch64") => "DarwinArm64".to_string(),
        ("windows", _) => "Windows64".to_string(),
        (os, arch) => format!("{os}-{arch}"),
    }
}

/// Flavors to try, in order, when a product is missing for the native flavor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Fallback flavors, most specific first
    pub fallbacks: Vec<String>,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            fallbacks: vec!["Generic".to_string()],
        }
    }
}

impl FallbackPolicy {
    pub fn new(fallbacks: Vec<String>) -> Self {
        Self { fallbacks }
    }

    /// The resolution chain for a flavor: the flavor itself followed by the
    /// fallbacks, without duplicates
    pub fn chain(&self, flavor: &str) -> Vec<String> {
        let mut out = vec![flavor.to_string()];
        for fallback in &self.fallbacks {
            if !out.iter().any(|f| f == fallback) {
                out.push(fallback.clone());
            }
        }
        out
    }
}
