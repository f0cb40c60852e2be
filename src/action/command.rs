//! Actions implemented by external commands.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::ActionRunner;
use crate::config::ActionDefinition;
use crate::error::{ImageLockError, Result};
use crate::types::FileKey;

/// Runs a configured program once per stale file.
///
/// A non-zero exit status or an elapsed timeout fails the action; stderr is
/// carried in the error message.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    name: String,
    definition: ActionDefinition,
    output_dir: PathBuf,
}

impl CommandRunner {
    pub fn new(name: impl Into<String>, definition: ActionDefinition, output_dir: PathBuf) -> Self {
        CommandRunner {
            name: name.into(),
            definition,
            output_dir,
        }
    }

    fn failure(&self, path: &Path, message: impl Into<String>) -> ImageLockError {
        ImageLockError::ActionFailed {
            action: self.name.clone(),
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Substitute `{path}`, `{key}` and `{output}` in every argument.
    fn expand_args(&self, path: &Path, key: &FileKey) -> Vec<String> {
        let path = path.display().to_string();
        let output = self.output_dir.display().to_string();
        self.definition
            .command
            .iter()
            .map(|arg| {
                arg.replace("{path}", &path)
                    .replace("{key}", key.as_str())
                    .replace("{output}", &output)
            })
            .collect()
    }
}

#[async_trait]
impl ActionRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, path: &Path, key: &FileKey) -> Result<()> {
        let args = self.expand_args(path, key);
        let Some((program, rest)) = args.split_first() else {
            return Err(self.failure(path, "empty command"));
        };
        debug!(action = %self.name, program = %program, key = %key, "spawning action command");

        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failure(path, format!("failed to spawn '{program}': {e}")))?;

        let output = match self.definition.timeout {
            Some(secs) => match timeout(Duration::from_secs(secs), child.wait_with_output()).await
            {
                Ok(result) => result,
                // The child is killed when its future is dropped.
                Err(_) => {
                    return Err(self.failure(path, format!("timed out after {secs}s")));
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|e| self.failure(path, e.to_string()))?;

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(
                path,
                format!("exited with {code}: {}", stderr.trim()),
            ));
        }
        Ok(())
    }
}
