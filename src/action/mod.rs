//! Action runners.
//!
//! An action is a named side effect applied to one file at a time. The
//! reconciler only sees the `ActionRunner` trait: it calls `run` for stale
//! files and records the file in the ledger when the call succeeds. Runners
//! never touch the ledger themselves.

mod command;
mod webp;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::Result;
use crate::types::FileKey;

pub use command::CommandRunner;
pub use webp::WebpRunner;

/// Name of the built-in WebP conversion action.
pub const WEBP_ACTION: &str = "webp";

#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Action name as recorded in the ledger.
    fn name(&self) -> &str;

    /// Apply the action to the file at `path`, known to the ledger as `key`.
    async fn run(&self, path: &Path, key: &FileKey) -> Result<()>;
}

/// Action without a side effect. Running it only registers the file state
/// under the action name.
#[derive(Debug, Clone)]
pub struct NoopRunner {
    name: String,
}

impl NoopRunner {
    pub fn new(name: impl Into<String>) -> Self {
        NoopRunner { name: name.into() }
    }
}

#[async_trait]
impl ActionRunner for NoopRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _path: &Path, _key: &FileKey) -> Result<()> {
        Ok(())
    }
}

/// Resolves action names to runners.
pub struct ActionRegistry;

impl ActionRegistry {
    /// Pick the runner for `action`.
    ///
    /// Commands configured under `actions:` take precedence over the
    /// built-in `webp` action; unknown names get a `NoopRunner`.
    pub fn resolve(action: &str, config: &Config) -> Arc<dyn ActionRunner> {
        if let Some(definition) = config.actions.get(action) {
            return Arc::new(CommandRunner::new(
                action,
                definition.clone(),
                config.output_dir.clone(),
            ));
        }
        if action == WEBP_ACTION {
            return Arc::new(WebpRunner::new(config.output_dir.clone()));
        }
        Arc::new(NoopRunner::new(action))
    }
}
