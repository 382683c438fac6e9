//! Filesystem staging: the root tree under construction.
//!
//! A [`StagedTree`] is the exclusively-owned root filesystem a build
//! assembles before packaging. Creation refuses to reuse an occupied path,
//! installs preserve declared mode and ownership, and the scrub pass strips
//! transient files (the staged resolv.conf above all) before archiving.

pub mod mounts;

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::StageError;
use crate::spec::{self, InstallDirective};

/// Path of the staged resolv.conf, relative to the tree root.
const RESOLV_CONF: &str = "etc/resolv.conf";

/// The root filesystem under construction. One per build run.
#[derive(Debug)]
pub struct StagedTree {
    root: PathBuf,
}

impl StagedTree {
    /// Create a fresh tree at `root`.
    ///
    /// Fails if the path is occupied; a pre-existing tree is never silently
    /// overwritten.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, StageError> {
        let root = root.into();
        ensure_target_free(&root)?;
        fs::create_dir_all(&root)
            .with_context(|| format!("creating staged tree {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a destination inside the tree. Leading slashes are relative
    /// to the tree root.
    pub fn path_for(&self, dst: &str) -> PathBuf {
        self.root.join(dst.trim_start_matches('/'))
    }

    /// Copy a host file into the tree, creating parent directories and
    /// applying the declared mode bits and numeric ownership.
    pub fn install(
        &self,
        src: &Path,
        dst: &str,
        mode: Option<u32>,
        owner: Option<(u32, u32)>,
    ) -> Result<(), StageError> {
        if !src.is_file() {
            return Err(StageError::MissingSource(src.to_path_buf()));
        }

        let dest = self.path_for(dst);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::copy(src, &dest)
            .with_context(|| format!("installing {} -> {}", src.display(), dest.display()))?;

        if let Some(mode) = mode {
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode))
                .with_context(|| format!("setting mode on {}", dest.display()))?;
        }
        if let Some((uid, gid)) = owner {
            std::os::unix::fs::chown(&dest, Some(uid), Some(gid))
                .with_context(|| format!("setting owner on {}", dest.display()))?;
        }
        Ok(())
    }

    /// Install a declared directive (modes and owner parsed from the spec).
    pub fn install_directive(&self, directive: &InstallDirective) -> Result<(), StageError> {
        let mode = directive.mode.as_deref().map(spec::parse_mode).transpose()?;
        let owner = directive
            .owner
            .as_deref()
            .map(spec::parse_owner)
            .transpose()?;
        self.install(Path::new(&directive.src), &directive.dst, mode, owner)
    }

    /// Copy the host resolv.conf into the tree so in-chroot commands can
    /// resolve names. Returns false when the host has none.
    pub fn stage_resolv_conf(&self) -> Result<bool> {
        let host = Path::new("/etc/resolv.conf");
        if !host.exists() {
            return Ok(false);
        }
        let dest = self.path_for(RESOLV_CONF);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        // fs::copy follows the symlink systemd-resolved setups use.
        fs::copy(host, &dest).context("staging host resolv.conf")?;
        Ok(true)
    }

    /// Remove transient files before packaging: the staged resolv.conf (the
    /// image must not carry host network identity) plus any declared paths.
    pub fn scrub(&self, extra: &[String]) -> Result<()> {
        let resolv = self.path_for(RESOLV_CONF);
        if resolv.exists() {
            fs::remove_file(&resolv).context("removing staged resolv.conf")?;
        }

        for entry in extra {
            let path = self.path_for(entry);
            if path.is_dir() {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("scrubbing {}", path.display()))?;
            } else if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("scrubbing {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Remove the whole tree. Best-effort, used on success and abort alike.
    pub fn remove(&self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// Fail fast if the target tree path is occupied.
pub fn ensure_target_free(path: &Path) -> Result<(), StageError> {
    if path.exists() {
        return Err(StageError::AlreadyExists(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_refuses_occupied_path() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        let _tree = StagedTree::create(&root).unwrap();

        let err = StagedTree::create(&root).unwrap_err();
        assert!(matches!(err, StageError::AlreadyExists(_)));
    }

    #[test]
    fn install_creates_parents_and_applies_mode() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("coredns");
        fs::write(&src, b"#!/bin/sh\n").unwrap();

        let tree = StagedTree::create(temp.path().join("rootfs")).unwrap();
        tree.install(&src, "/usr/local/bin/coredns", Some(0o755), None)
            .unwrap();

        let installed = tree.path_for("usr/local/bin/coredns");
        assert!(installed.is_file());
        let mode = fs::metadata(&installed).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o755);
    }

    #[test]
    fn install_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let tree = StagedTree::create(temp.path().join("rootfs")).unwrap();
        let err = tree
            .install(&temp.path().join("missing"), "etc/x", None, None)
            .unwrap_err();
        assert!(matches!(err, StageError::MissingSource(_)));
    }

    #[test]
    fn path_for_strips_leading_slash() {
        let temp = TempDir::new().unwrap();
        let tree = StagedTree::create(temp.path().join("rootfs")).unwrap();
        assert_eq!(
            tree.path_for("/etc/coredns/Corefile"),
            tree.path_for("etc/coredns/Corefile")
        );
    }

    #[test]
    fn scrub_removes_resolv_conf_and_extras() {
        let temp = TempDir::new().unwrap();
        let tree = StagedTree::create(temp.path().join("rootfs")).unwrap();

        let resolv = tree.path_for("etc/resolv.conf");
        fs::create_dir_all(resolv.parent().unwrap()).unwrap();
        fs::write(&resolv, "nameserver 10.0.0.1\n").unwrap();

        let cache = tree.path_for("var/cache/apt/archives");
        fs::create_dir_all(&cache).unwrap();
        fs::write(cache.join("pkg.deb"), b"x").unwrap();

        tree.scrub(&["var/cache/apt/archives".to_string()]).unwrap();

        assert!(!resolv.exists());
        assert!(!cache.exists());
    }

    #[test]
    fn scrub_is_safe_when_nothing_staged() {
        let temp = TempDir::new().unwrap();
        let tree = StagedTree::create(temp.path().join("rootfs")).unwrap();
        tree.scrub(&["does/not/exist".to_string()]).unwrap();
    }
}
