use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// Default directory scanned when no root is given.
pub const DEFAULT_ROOT: &str = "./images";

/// Default location of the persisted ledger.
pub const DEFAULT_LEDGER_FILE: &str = "./image-lock.json";

/// Platform metadata files that are never visited, in addition to dotfiles.
const SKIPPED_NAMES: &[&str] = &["Thumbs.db", "desktop.ini"];

/// Normalized, root-relative path of a file, always using `/` separators.
///
/// A rename is observed as the removal of one key and the creation of another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileKey(String);

impl FileKey {
    pub fn new(key: impl Into<String>) -> Self {
        FileKey(key.into())
    }

    /// Build the key for `path` relative to `root`.
    ///
    /// Returns `None` when `path` is not inside `root`, is `root` itself, or
    /// has a component that is not valid UTF-8. Such names cannot be keyed
    /// without two distinct files colliding.
    pub fn from_path(root: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            if let Component::Normal(part) = component {
                parts.push(part.to_str()?);
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(FileKey(parts.join("/")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key lies beneath the directory key `prefix`.
    pub fn is_under(&self, prefix: &FileKey) -> bool {
        self.0
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-file state marker. Only equality is meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FreshnessToken(String);

impl FreshnessToken {
    pub fn new(token: impl Into<String>) -> Self {
        FreshnessToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FreshnessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Action name to the token the action last succeeded under.
pub type ActionRecord = BTreeMap<String, FreshnessToken>;

/// The persisted ledger contents.
pub type LedgerMap = BTreeMap<FileKey, ActionRecord>;

/// Fixed skip rule for directory entries and watch notifications.
pub fn is_skipped_name(name: &str) -> bool {
    name.starts_with('.') || SKIPPED_NAMES.contains(&name)
}
