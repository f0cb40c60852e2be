//! Atomic file writes for ledger persistence

use std::path::{Path, PathBuf};

use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;

use crate::error::{ImageLockError, Result};

/// Path of the temporary sibling used while writing `path`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write file atomically using temp file and rename.
///
/// The original file is never in a partially written state: either the new
/// content is fully written and synced, or the original file is unchanged.
pub async fn write_file_async_atomic(path: &Path, content: &str) -> Result<()> {
    ensure_parent_dir_async(path).await?;

    let temp_path = temp_path_for(path);
    let persist_err = |source| ImageLockError::Persist {
        path: path.to_path_buf(),
        source,
    };

    {
        let mut file = tokio_fs::File::create(&temp_path)
            .await
            .map_err(persist_err)?;
        file.write_all(content.as_bytes())
            .await
            .map_err(persist_err)?;
        file.sync_all().await.map_err(persist_err)?;
    }

    if let Err(e) = tokio_fs::rename(&temp_path, path).await {
        let _ = tokio_fs::remove_file(&temp_path).await;
        return Err(persist_err(e));
    }
    Ok(())
}

/// Ensure parent directory exists
pub async fn ensure_parent_dir_async(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !tokio_fs::try_exists(parent).await.unwrap_or(false)
    {
        tokio_fs::create_dir_all(parent)
            .await
            .map_err(|e| ImageLockError::Persist {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }
    Ok(())
}
