//! Component manifests.
//!
//! Each location names a TOML manifest describing what the file at that
//! location provides:
//!
//! ```toml
//! name = "dhtfox-core"
//! abi_version = 1
//! entries = ["dhtfox.MemoryDht"]
//! requires = ["dhtfox-runtime"]
//! ```

use super::location::ComponentLocation;
use super::traits::COMPONENT_ABI_VERSION;
use serde::{Deserialize, Serialize};

/// Parsed component manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentManifest {
    /// Name other manifests use in `requires`.
    pub name: String,

    pub abi_version: u32,

    /// Entry symbols this location exports.
    #[serde(default)]
    pub entries: Vec<String>,

    /// Names of manifests that must be in the same load.
    #[serde(default)]
    pub requires: Vec<String>,
}

impl ComponentManifest {
    /// Manifest exporting `entries` at the current ABI version.
    pub fn new(name: impl Into<String>, entries: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            abi_version: COMPONENT_ABI_VERSION,
            entries: entries.into_iter().collect(),
            requires: Vec::new(),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn exports(&self, entry: &str) -> bool {
        self.entries.iter().any(|e| e == entry)
    }
}

/// Manifest together with the location it was fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedManifest {
    pub location: ComponentLocation,
    pub manifest: ComponentManifest,
}
