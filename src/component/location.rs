//! Component locations.
//!
//! A location names one component manifest. Hosts hand us either `file://`
//! URLs (built from an extension install root) or plain filesystem paths, and
//! on Windows those arrive with backslashes. Both spellings of the same file
//! normalise to the same location so trust checks cannot be dodged by
//! rewriting a path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const FILE_SCHEME: &str = "file://";

/// Normalised address of a component manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ComponentLocation(String);

impl ComponentLocation {
    /// Parse a `file://` URL or a plain path.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let without_scheme = match trimmed.get(..FILE_SCHEME.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(FILE_SCHEME) => {
                &trimmed[FILE_SCHEME.len()..]
            }
            _ => trimmed,
        };
        Self(normalise(without_scheme))
    }

    /// Build a location for `relative` under a host installation root.
    ///
    /// The root may use either separator; the result is always a forward-slash
    /// path, the same one `parse` would produce for the matching `file:///` URL.
    pub fn from_install_root(root: &Path, relative: &str) -> Self {
        let root = root.to_string_lossy();
        let root = root.trim_end_matches(['/', '\\']);
        let relative = relative.trim_start_matches(['/', '\\']);
        Self::parse(&format!("{root}/{relative}"))
    }

    /// The location as a `file:///` URL.
    pub fn to_url(&self) -> String {
        if self.0.starts_with('/') {
            format!("file://{}", self.0)
        } else {
            format!("file:///{}", self.0)
        }
    }

    /// Filesystem path the manifest is read from.
    pub fn to_path(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Collapse separators and strip the extra leading slash of `file:///C:/...`.
fn normalise(raw: &str) -> String {
    let forward = raw.replace('\\', "/");

    let mut out = String::with_capacity(forward.len());
    let mut last_was_slash = false;
    for c in forward.chars() {
        if c == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(c);
    }

    // "/C:/dir" -> "C:/dir"
    let bytes = out.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':'
    {
        out.remove(0);
    }

    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

impl From<String> for ComponentLocation {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for ComponentLocation {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<ComponentLocation> for String {
    fn from(location: ComponentLocation) -> Self {
        location.0
    }
}

impl fmt::Display for ComponentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url())
    }
}
