//! Command execution inside the staged tree.
//!
//! Commands run via the host `chroot` binary with a cleared environment:
//! only the spec's allow-list (PATH at minimum) and its declared variables
//! reach the command, so host state cannot leak into the image.

use anyhow::Result;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use crate::process::Cmd;

/// Search path used inside the tree when the allow-list drops PATH.
const FALLBACK_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Captured result of one in-chroot command.
#[derive(Debug)]
pub struct ChrootOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ChrootOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `argv` inside the tree, working directory at the tree root.
///
/// The exit code is reported, not judged; required-versus-best-effort
/// policy belongs to the caller.
pub fn run(
    tree: &Path,
    argv: &[String],
    env_allow: &[String],
    extra_env: &BTreeMap<String, String>,
) -> Result<ChrootOutput> {
    let mut cmd = Cmd::new("chroot")
        .arg_path(tree)
        .args(argv)
        .dir(tree)
        .env_clear()
        .allow_fail();

    let mut path_set = false;
    for key in env_allow {
        if let Ok(value) = env::var(key) {
            if key == "PATH" {
                path_set = true;
            }
            cmd = cmd.env(key, &value);
        }
    }
    for (key, value) in extra_env {
        if key == "PATH" {
            path_set = true;
        }
        cmd = cmd.env(key, value);
    }
    if !path_set {
        cmd = cmd.env("PATH", FALLBACK_PATH);
    }

    let result = cmd.run()?;
    Ok(ChrootOutput {
        exit_code: result.code(),
        stdout: result.stdout,
        stderr: result.stderr,
    })
}
