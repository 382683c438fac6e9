//! Pseudo-filesystem bind mounts for the staged tree.
//!
//! `/proc`, `/sys`, and `/dev` are bound into the tree so in-chroot
//! configuration commands (package managers, service tooling) behave.
//! Unmounting is idempotent: it consults `/proc/mounts` and skips anything
//! that is not actually mounted, so cleanup paths can call it blindly.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// Bind-mount the named pseudo filesystems from the host into the tree.
pub fn mount_pseudo(tree: &Path, names: &[String]) -> Result<()> {
    for name in names {
        let source = Path::new("/").join(name);
        let target = tree.join(name);
        fs::create_dir_all(&target)
            .with_context(|| format!("creating mount point {}", target.display()))?;

        Cmd::new("mount")
            .arg("--bind")
            .arg_path(&source)
            .arg_path(&target)
            .error_msg(format!("bind mount of /{name} failed"))
            .run()?;
        println!("  Mounted /{} -> {}", name, target.display());
    }
    Ok(())
}

/// Unmount the named pseudo filesystems, in reverse order.
///
/// Safe to call when nothing (or only some) of them are mounted.
pub fn unmount_pseudo(tree: &Path, names: &[String]) -> Result<()> {
    let mounts = read_mounts();
    let tree = canonical(tree);

    for name in names.iter().rev() {
        let target = tree.join(name);
        if !is_mount_point(&mounts, &target) {
            continue;
        }
        Cmd::new("umount")
            .arg_path(&target)
            .error_msg(format!("unmount of {} failed", target.display()))
            .run()?;
        println!("  Unmounted {}", target.display());
    }
    Ok(())
}

/// Current mount table. Empty on hosts without `/proc` (nothing can be
/// mounted there either).
pub fn read_mounts() -> String {
    fs::read_to_string("/proc/mounts").unwrap_or_default()
}

/// Whether `path` appears as a mount point in a `/proc/mounts` listing.
pub fn is_mount_point(mounts: &str, path: &Path) -> bool {
    let wanted = path.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| decode_mount_path(mount_point) == wanted)
}

/// Mount points from a `/proc/mounts` listing that sit at or below `tree`.
pub fn mount_points_under(mounts: &str, tree: &Path) -> Vec<PathBuf> {
    let tree = canonical(tree);
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|mount_point| PathBuf::from(decode_mount_path(mount_point)))
        .filter(|mount_point| mount_point.starts_with(&tree))
        .collect()
}

/// Decode the octal escapes the kernel applies to whitespace in mount-point
/// fields (`\040` for space, `\011` for tab, `\134` for backslash).
fn decode_mount_path(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let code = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(code, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
proc /proc proc rw,nosuid,nodev,noexec 0 0
sysfs /sys sysfs rw,nosuid,nodev,noexec 0 0
proc /tmp/build1/rootfs/proc proc rw 0 0
sysfs /tmp/build1/rootfs/sys sysfs rw 0 0
udev /tmp/build1/rootfs/dev devtmpfs rw 0 0
";

    #[test]
    fn detects_mount_points() {
        assert!(is_mount_point(MOUNTS, Path::new("/tmp/build1/rootfs/proc")));
        assert!(!is_mount_point(MOUNTS, Path::new("/tmp/build1/rootfs/etc")));
        assert!(!is_mount_point(MOUNTS, Path::new("/tmp/build2/rootfs/proc")));
    }

    #[test]
    fn finds_mounts_under_tree() {
        let under = mount_points_under(MOUNTS, Path::new("/tmp/build1/rootfs"));
        assert_eq!(under.len(), 3);
        assert!(under.contains(&PathBuf::from("/tmp/build1/rootfs/dev")));
    }

    #[test]
    fn host_mounts_are_not_under_tree() {
        let under = mount_points_under(MOUNTS, Path::new("/tmp/other"));
        assert!(under.is_empty());
    }

    #[test]
    fn decodes_escaped_whitespace_in_mount_points() {
        let mounts = "proc /tmp/build\\040one/rootfs/proc proc rw 0 0\n";
        assert!(is_mount_point(mounts, Path::new("/tmp/build one/rootfs/proc")));
        assert!(!is_mount_point(mounts, Path::new("/tmp/build\\040one/rootfs/proc")));

        let under = mount_points_under(mounts, Path::new("/tmp/build one/rootfs"));
        assert_eq!(under, [PathBuf::from("/tmp/build one/rootfs/proc")]);
    }

    #[test]
    fn unmount_is_idempotent_on_unmounted_tree() {
        let temp = tempfile::TempDir::new().unwrap();
        let names = vec!["proc".to_string(), "sys".to_string(), "dev".to_string()];
        // Nothing is mounted under the temp dir; both calls are no-ops.
        unmount_pseudo(temp.path(), &names).unwrap();
        unmount_pseudo(temp.path(), &names).unwrap();
    }
}
