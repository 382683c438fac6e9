//! Image packaging: reproducible tarball plus checksum manifest.
//!
//! Archives are created with `--numeric-owner` so ownership is recorded as
//! raw UID/GID numbers and the result does not depend on the host's user
//! database. The archive's SHA-256 is written alongside it in
//! `sha256sum`-compatible format.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::fetch;
use crate::process::Cmd;
use crate::stage::mounts;

/// Outcome of a successful packaging step.
#[derive(Debug)]
pub struct BuildResult {
    /// Path of the produced archive.
    pub archive: PathBuf,
    /// Hex SHA-256 of the archive bytes.
    pub sha256: String,
    /// Phase-by-phase record of the run, filled in by the orchestrator.
    pub log: Vec<String>,
}

/// Archive file name for a product/version pair.
pub fn archive_name(product: &str, version: &str) -> String {
    format!("{product}-{version}.tar.gz")
}

/// Archive the tree into `<output_dir>/<product>-<version>.tar.gz` and write
/// the `.sha256` manifest next to it.
///
/// The mounted-tree invariant is re-checked here rather than trusted from
/// caller ordering: packaging a tree with pseudo filesystems still bound
/// would capture live host state into the image.
pub fn archive(tree: &Path, output_dir: &Path, product: &str, version: &str) -> Result<BuildResult> {
    let mounted = mounts::mount_points_under(&mounts::read_mounts(), tree);
    if !mounted.is_empty() {
        let listing = mounted
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        bail!(
            "refusing to package {}: pseudo filesystems still mounted: {listing}",
            tree.display()
        );
    }

    let file_count = WalkDir::new(tree)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();

    let archive_path = output_dir.join(archive_name(product, version));
    println!("Creating archive ({file_count} files)...");

    Cmd::new("tar")
        .arg("--numeric-owner")
        .arg("-czf")
        .arg_path(&archive_path)
        .arg("-C")
        .arg_path(tree)
        .arg(".")
        .error_msg("tar failed")
        .run()?;

    let size = fs::metadata(&archive_path)
        .with_context(|| format!("reading {}", archive_path.display()))?
        .len();
    println!("  Archive size: {:.2} MB", size as f64 / 1024.0 / 1024.0);

    let sha256 = fetch::file_sha256(&archive_path)?;
    let manifest = write_manifest(&archive_path, &sha256)?;
    println!("  Checksum: {}", manifest.display());

    Ok(BuildResult {
        archive: archive_path,
        sha256,
        log: Vec::new(),
    })
}

/// Write `<archive>.sha256` with the conventional `<digest>  <filename>`
/// line, verifiable with `sha256sum -c`.
pub fn write_manifest(archive: &Path, sha256: &str) -> Result<PathBuf> {
    let file_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .context("archive has no file name")?;
    let manifest = archive.with_file_name(format!("{file_name}.sha256"));
    fs::write(&manifest, format!("{sha256}  {file_name}\n"))
        .with_context(|| format!("writing {}", manifest.display()))?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn archive_name_formatting() {
        assert_eq!(archive_name("sector-dns", "2.0.1"), "sector-dns-2.0.1.tar.gz");
        assert_eq!(archive_name("sector-dns", "dev"), "sector-dns-dev.tar.gz");
    }

    #[test]
    fn manifest_is_sha256sum_compatible() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("sector-dns-dev.tar.gz");
        fs::write(&archive, b"bytes").unwrap();

        let manifest = write_manifest(&archive, "cafebabe").unwrap();
        assert_eq!(
            fs::read_to_string(&manifest).unwrap(),
            "cafebabe  sector-dns-dev.tar.gz\n"
        );
        assert_eq!(
            manifest.file_name().unwrap(),
            "sector-dns-dev.tar.gz.sha256"
        );
    }
}
