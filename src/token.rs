//! Freshness tokens: the per-file state marker compared against the ledger.

use std::fs::Metadata;
use std::path::Path;
use std::time::SystemTime;

use jiff::Timestamp;
use jiff::tz::TimeZone;
use serde::{Deserialize, Serialize};

use crate::error::{ImageLockError, Result};
use crate::types::FreshnessToken;

/// Produces the freshness token of a file from its metadata.
///
/// Implementations must return equal tokens for an unchanged file and a
/// different token once the file changes.
pub trait FreshnessSource: Send + Sync {
    fn token(&self, path: &Path, metadata: &Metadata) -> Result<FreshnessToken>;
}

/// Which file time serves as the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenField {
    #[default]
    Modified,
    Created,
    Accessed,
}

impl std::fmt::Display for TokenField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenField::Modified => write!(f, "modified"),
            TokenField::Created => write!(f, "created"),
            TokenField::Accessed => write!(f, "accessed"),
        }
    }
}

impl std::str::FromStr for TokenField {
    type Err = ImageLockError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "modified" | "mtime" => Ok(TokenField::Modified),
            "created" | "birthtime" => Ok(TokenField::Created),
            "accessed" | "atime" => Ok(TokenField::Accessed),
            _ => Err(ImageLockError::Config(format!(
                "unknown token field '{}', expected 'modified', 'created' or 'accessed'",
                s
            ))),
        }
    }
}

/// Uses a file time formatted as an ISO-8601 UTC timestamp with millisecond
/// precision, e.g. `2022-03-01T10:00:00.123Z`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MtimeSource {
    field: TokenField,
}

impl MtimeSource {
    pub fn new(field: TokenField) -> Self {
        MtimeSource { field }
    }
}

impl FreshnessSource for MtimeSource {
    fn token(&self, path: &Path, metadata: &Metadata) -> Result<FreshnessToken> {
        let time = match self.field {
            TokenField::Modified => metadata.modified(),
            TokenField::Created => metadata.created(),
            TokenField::Accessed => metadata.accessed(),
        }
        .map_err(|source| ImageLockError::Traversal {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(FreshnessToken::new(format_timestamp(time)))
    }
}

fn format_timestamp(time: SystemTime) -> String {
    match Timestamp::try_from(time) {
        Ok(ts) => {
            let dt = ts.to_zoned(TimeZone::UTC).datetime();
            format!(
                "{}.{:03}Z",
                dt.strftime("%Y-%m-%dT%H:%M:%S"),
                dt.subsec_nanosecond() / 1_000_000
            )
        }
        // Outside jiff's supported range; still a stable, comparable token.
        Err(_) => format!("{time:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    #[test]
    fn test_format_timestamp_millis() {
        let time = UNIX_EPOCH + Duration::from_millis(1_646_128_800_123);
        assert_eq!(format_timestamp(time), "2022-03-01T10:00:00.123Z");
    }

    #[test]
    fn test_token_field_from_str() {
        assert_eq!("modified".parse::<TokenField>().unwrap(), TokenField::Modified);
        assert_eq!("CREATED".parse::<TokenField>().unwrap(), TokenField::Created);
        assert_eq!("atime".parse::<TokenField>().unwrap(), TokenField::Accessed);
        assert!("changed".parse::<TokenField>().is_err());
    }

    #[test]
    fn test_token_stable_for_unchanged_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"png").unwrap();

        let source = MtimeSource::default();
        let first = source
            .token(&path, &std::fs::metadata(&path).unwrap())
            .unwrap();
        let second = source
            .token(&path, &std::fs::metadata(&path).unwrap())
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_token_changes_with_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"png").unwrap();

        let source = MtimeSource::new(TokenField::Modified);
        let before = source
            .token(&path, &std::fs::metadata(&path).unwrap())
            .unwrap();

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(1_000_000))
            .unwrap();
        drop(file);

        let after = source
            .token(&path, &std::fs::metadata(&path).unwrap())
            .unwrap();
        assert_ne!(before, after);
        assert_eq!(after.as_str(), "1970-01-12T13:46:40.000Z");
    }
}
