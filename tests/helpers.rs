//! Shared test utilities for sectorbuild tests.

#![allow(dead_code)]

use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use sectorbuild::config::Config;

/// Test environment with a work directory, asset sources, and a cache.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Work directory (stands in for $CHROOT)
    pub work_dir: PathBuf,
    /// Source files staged into the tree
    pub assets: PathBuf,
    /// Artifact cache directory
    pub cache_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let work_dir = base.join("work");
        let assets = base.join("assets");
        let cache_dir = base.join("cache");

        fs::create_dir_all(&work_dir).expect("Failed to create work dir");
        fs::create_dir_all(&assets).expect("Failed to create assets dir");

        Self {
            _temp_dir: temp_dir,
            work_dir,
            assets,
            cache_dir,
        }
    }

    /// Build configuration pointing at this environment.
    pub fn config(&self, version: &str) -> Config {
        Config {
            work_dir: self.work_dir.clone(),
            version: version.to_string(),
            cache_dir: self.cache_dir.clone(),
        }
    }

    /// Write an asset file and return its path.
    pub fn write_asset(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.assets.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create asset parent dir");
        }
        fs::write(&path, contents).expect("Failed to write asset");
        path
    }
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Install a stub `chroot` into `dir` that drops the tree argument and runs
/// the command on the host. Lets pipeline tests exercise the configure phase
/// without root; the working directory is still the tree root.
pub fn install_stub_chroot(dir: &Path) {
    fs::create_dir_all(dir).expect("Failed to create stub dir");
    let path = dir.join("chroot");
    fs::write(&path, "#!/bin/sh\nshift\nexec \"$@\"\n").expect("Failed to write stub chroot");

    let mut perms = fs::metadata(&path)
        .expect("Failed to get stub metadata")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("Failed to set stub permissions");
}

/// Prepend a directory to PATH, restoring the original value on drop.
pub struct PathGuard {
    original: String,
}

impl PathGuard {
    pub fn prepend(dir: &Path) -> Self {
        let original = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{original}", dir.display()));
        Self { original }
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        std::env::set_var("PATH", &self.original);
    }
}
