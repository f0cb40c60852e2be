//! Built-in WebP conversion.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::ImageFormat;
use tracing::debug;

use super::{ActionRunner, WEBP_ACTION};
use crate::error::{ImageLockError, Result};
use crate::types::FileKey;

/// Writes a lossless WebP copy of each image to
/// `<output_dir>/<key>` with the extension replaced by `.webp`.
#[derive(Debug, Clone)]
pub struct WebpRunner {
    output_dir: PathBuf,
}

impl WebpRunner {
    pub fn new(output_dir: PathBuf) -> Self {
        WebpRunner { output_dir }
    }

    /// Destination of the converted copy of `key`.
    pub fn destination(&self, key: &FileKey) -> PathBuf {
        self.output_dir.join(key.as_str()).with_extension("webp")
    }
}

fn convert(source: &Path, destination: &Path) -> std::result::Result<(), String> {
    let img = image::open(source).map_err(|e| format!("failed to decode image: {e}"))?;
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
    }
    img.to_rgba8()
        .save_with_format(destination, ImageFormat::WebP)
        .map_err(|e| format!("failed to encode webp: {e}"))
}

#[async_trait]
impl ActionRunner for WebpRunner {
    fn name(&self) -> &str {
        WEBP_ACTION
    }

    async fn run(&self, path: &Path, key: &FileKey) -> Result<()> {
        let source = path.to_path_buf();
        let destination = self.destination(key);
        debug!(key = %key, destination = %destination.display(), "converting to webp");

        // Decoding and encoding are CPU-bound.
        let result = tokio::task::spawn_blocking(move || convert(&source, &destination))
            .await
            .map_err(|e| e.to_string())
            .and_then(|inner| inner);

        result.map_err(|message| ImageLockError::ActionFailed {
            action: WEBP_ACTION.to_string(),
            path: path.to_path_buf(),
            message,
        })
    }
}
