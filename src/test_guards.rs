//! Working-directory guard for tests that resolve relative defaults such as
//! `./images` or `image-lock.yaml`.
//!
//! The working directory is process-global, so tests using the guard must be
//! `#[serial]`.

use std::env;
use std::io;
use std::path::{Path, PathBuf};

/// Switches into a directory and switches back on drop, even on panic.
pub struct CwdGuard {
    original: PathBuf,
}

impl CwdGuard {
    pub fn enter(dir: &Path) -> io::Result<Self> {
        let original = env::current_dir()?;
        env::set_current_dir(dir)?;
        Ok(Self { original })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = env::set_current_dir(&self.original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_enter_and_restore() {
        let original = env::current_dir().unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let _guard = CwdGuard::enter(tmp.path()).unwrap();
            assert_eq!(
                env::current_dir().unwrap().canonicalize().unwrap(),
                tmp.path().canonicalize().unwrap()
            );
        }
        assert_eq!(env::current_dir().unwrap(), original);
    }
}
