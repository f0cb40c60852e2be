#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tempfile::TempDir;

/// Runs the `image-lock` binary in an isolated temp directory with an
/// `images/` tree.
pub struct ImageLockTest {
    pub temp_dir: TempDir,
    binary_path: PathBuf,
}

impl ImageLockTest {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        fs::create_dir_all(temp_dir.path().join("images")).expect("Failed to create images dir");
        ImageLockTest {
            temp_dir,
            binary_path: PathBuf::from(env!("CARGO_BIN_EXE_image-lock")),
        }
    }

    pub fn run(&self, args: &[&str]) -> Output {
        Command::new(&self.binary_path)
            .args(args)
            .current_dir(self.temp_dir.path())
            .env_remove("RUST_LOG")
            .output()
            .expect("Failed to execute image-lock")
    }

    pub fn run_success(&self, args: &[&str]) -> String {
        let output = self.run(args);
        if !output.status.success() {
            panic!(
                "Command {:?} failed with status {:?}\nstdout: {}\nstderr: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    pub fn run_failure(&self, args: &[&str]) -> Output {
        let output = self.run(args);
        assert!(
            !output.status.success(),
            "Expected command {:?} to fail, but it succeeded",
            args
        );
        output
    }

    /// Run with `--json` and parse the printed stats.
    pub fn run_json(&self, args: &[&str]) -> Value {
        let mut args = args.to_vec();
        args.push("--json");
        let stdout = self.run_success(&args);
        serde_json::from_str(&stdout).expect("Failed to parse stats JSON")
    }

    pub fn image_path(&self, key: &str) -> PathBuf {
        self.temp_dir.path().join("images").join(key)
    }

    /// Create an image file, with parent directories.
    pub fn write_image(&self, key: &str, content: &[u8]) {
        let path = self.image_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create image parent dir");
        }
        fs::write(&path, content).expect("Failed to write image");
    }

    /// Push the modification time of an image forward.
    pub fn touch_image(&self, key: &str, offset: Duration) {
        let file = fs::File::options()
            .write(true)
            .open(self.image_path(key))
            .expect("Failed to open image");
        file.set_modified(SystemTime::now() + offset)
            .expect("Failed to set mtime");
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.temp_dir.path().join("image-lock.json")
    }

    pub fn read_ledger_raw(&self) -> String {
        fs::read_to_string(self.ledger_path()).expect("Failed to read ledger")
    }

    pub fn read_ledger(&self) -> Value {
        serde_json::from_str(&self.read_ledger_raw()).expect("Failed to parse ledger")
    }

    pub fn write_file(&self, relative: impl AsRef<Path>, content: &str) {
        fs::write(self.temp_dir.path().join(relative), content).expect("Failed to write file");
    }
}

impl Default for ImageLockTest {
    fn default() -> Self {
        Self::new()
    }
}
