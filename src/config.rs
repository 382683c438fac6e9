//! Configuration from environment variables and `.env`.
//!
//! The build's ambient inputs are explicit here instead of being read ad hoc
//! by the pipeline: the work directory (`CHROOT`), the image version
//! (`VERSION`), and the artifact cache location (`SECTORBUILD_CACHE`).
//! Environment variables take precedence over `.env`.

use std::env;
use std::fs;
use std::path::PathBuf;

use crate::error::BuildError;

/// Default version string when `VERSION` is unset.
pub const DEFAULT_VERSION: &str = "dev";

/// Name of the staged tree directory inside the work directory.
pub const TREE_DIR: &str = "rootfs";

/// Resolved build configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Work directory (`CHROOT`). Must pre-exist and be writable; the staged
    /// tree and the output archive live under it.
    pub work_dir: PathBuf,
    /// Image version (`VERSION`), used in the archive name.
    pub version: String,
    /// Artifact cache directory (`SECTORBUILD_CACHE`).
    pub cache_dir: PathBuf,
}

impl Config {
    /// Load configuration from `.env` and the environment.
    pub fn from_env() -> Result<Self, BuildError> {
        dotenvy::dotenv().ok();

        let work_dir = env::var("CHROOT")
            .map(PathBuf::from)
            .map_err(|_| BuildError::MissingInput("CHROOT is not set".to_string()))?;

        if !work_dir.is_dir() {
            return Err(BuildError::MissingInput(format!(
                "CHROOT does not exist or is not a directory: {}",
                work_dir.display()
            )));
        }

        // Probe writability up front rather than failing mid-pipeline.
        let probe = work_dir.join(".sectorbuild-write-probe");
        fs::write(&probe, b"").map_err(|e| {
            BuildError::MissingInput(format!(
                "CHROOT is not writable: {} ({e})",
                work_dir.display()
            ))
        })?;
        let _ = fs::remove_file(&probe);

        let version = env::var("VERSION").unwrap_or_else(|_| DEFAULT_VERSION.to_string());

        let cache_dir = env::var("SECTORBUILD_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::cache_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("sectorbuild")
            });

        Ok(Self {
            work_dir,
            version,
            cache_dir,
        })
    }

    /// Path of the staged tree for this build.
    pub fn tree_path(&self) -> PathBuf {
        self.work_dir.join(TREE_DIR)
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  CHROOT: {}", self.work_dir.display());
        println!("  VERSION: {}", self.version);
        println!("  Cache: {}", self.cache_dir.display());
    }
}
