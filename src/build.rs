//! Build orchestration.
//!
//! One build per invocation, driven through an explicit state machine:
//!
//! ```text
//! Init -> Fetching -> Staging -> Configuring -> Unmounting -> Packaging -> Done
//! ```
//!
//! `Aborting` is reachable from every non-terminal state and always unmounts
//! pseudo filesystems and removes the partial tree before the run reports
//! `Failed`. No error path leaves host mounts bound inside the tree.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::chroot;
use crate::config::Config;
use crate::error::BuildError;
use crate::fetch::Fetcher;
use crate::package::{self, BuildResult};
use crate::process::Cmd;
use crate::spec::{parse_mode, BuildSpec};
use crate::stage::{self, mounts, StagedTree};

/// Pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Init,
    Fetching,
    Staging,
    Configuring,
    Unmounting,
    Packaging,
    Done,
    Aborting,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildState::Init => "Init",
            BuildState::Fetching => "Fetching",
            BuildState::Staging => "Staging",
            BuildState::Configuring => "Configuring",
            BuildState::Unmounting => "Unmounting",
            BuildState::Packaging => "Packaging",
            BuildState::Done => "Done",
            BuildState::Aborting => "Aborting",
            BuildState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Sequences one build from spec to archive, owning the staged tree for the
/// duration of the run.
pub struct Orchestrator {
    config: Config,
    spec: BuildSpec,
    state: BuildState,
    log: Vec<String>,
    tree_created: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config, spec: BuildSpec) -> Self {
        Self {
            config,
            spec,
            state: BuildState::Init,
            log: Vec::new(),
            tree_created: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Shared flag, set once this run has created the staged tree. Cleanup
    /// paths outside the orchestrator (the interrupt handler) must not
    /// remove a tree that was already there.
    pub fn tree_created_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.tree_created)
    }

    /// Run the build to completion. Any failure routes through the abort
    /// path before the error is returned.
    pub async fn run(mut self) -> Result<BuildResult, BuildError> {
        let started = Instant::now();
        println!("=== {} build ===", self.spec.product);
        self.config.print();

        match self.execute().await {
            Ok(mut result) => {
                self.set_state(BuildState::Done);
                println!("Build finished in {:.1}s", started.elapsed().as_secs_f64());
                println!("  Archive: {}", result.archive.display());
                println!("  SHA-256: {}", result.sha256);
                result.log = std::mem::take(&mut self.log);
                Ok(result)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    async fn execute(&mut self) -> Result<BuildResult, BuildError> {
        let tree_path = self.config.tree_path();

        // Init validates the target before any side effect: nothing is
        // fetched when the tree path is already occupied.
        stage::ensure_target_free(&tree_path).map_err(|e| BuildError::Staging(e.into()))?;

        self.set_state(BuildState::Fetching);
        let fetcher = Fetcher::new(&self.config.cache_dir);
        let fetched = fetcher
            .fetch_all(&self.spec.artifacts)
            .await
            .map_err(|e| BuildError::Fetch(e.into()))?;

        self.set_state(BuildState::Staging);
        let tree = StagedTree::create(&tree_path).map_err(|e| BuildError::Staging(e.into()))?;
        self.tree_created.store(true, Ordering::SeqCst);
        self.bootstrap_base(&tree).map_err(BuildError::Staging)?;
        mounts::mount_pseudo(tree.root(), &self.spec.pseudo_filesystems)
            .map_err(BuildError::Staging)?;
        self.stage_artifacts(&tree, &fetched)
            .map_err(BuildError::Staging)?;
        for directive in &self.spec.install {
            tree.install_directive(directive)
                .map_err(|e| BuildError::Staging(e.into()))?;
            println!("  Installed {} -> {}", directive.src, directive.dst);
        }
        if !self.spec.chroot.commands.is_empty() {
            let staged = tree.stage_resolv_conf().map_err(BuildError::Staging)?;
            if !staged {
                eprintln!(
                    "  [WARN] Host has no /etc/resolv.conf; in-chroot name resolution may fail"
                );
            }
        }

        self.set_state(BuildState::Configuring);
        self.configure(&tree)?;

        self.set_state(BuildState::Unmounting);
        mounts::unmount_pseudo(tree.root(), &self.spec.pseudo_filesystems)
            .map_err(BuildError::Staging)?;
        tree.scrub(&self.spec.package.scrub)
            .map_err(BuildError::Staging)?;

        self.set_state(BuildState::Packaging);
        let result = package::archive(
            tree.root(),
            &self.config.work_dir,
            &self.spec.product,
            &self.config.version,
        )
        .map_err(BuildError::Packaging)?;

        // Staging served its purpose; only the archive and manifest remain.
        tree.remove();
        Ok(result)
    }

    /// Run the bootstrapper into the fresh tree, streaming its output.
    fn bootstrap_base(&self, tree: &StagedTree) -> Result<()> {
        let Some(base) = &self.spec.base else {
            return Ok(());
        };
        println!("Bootstrapping {} via {}...", base.suite, base.bootstrapper);

        let mut cmd = Cmd::new(&base.bootstrapper);
        if let Some(variant) = &base.variant {
            cmd = cmd.arg(format!("--variant={variant}"));
        }
        cmd = cmd.arg(&base.suite).arg_path(tree.root());
        if let Some(mirror) = &base.mirror {
            cmd = cmd.arg(mirror);
        }
        cmd.error_msg(format!("{} failed", base.bootstrapper))
            .run_streaming()?;
        Ok(())
    }

    fn stage_artifacts(
        &self,
        tree: &StagedTree,
        fetched: &HashMap<String, PathBuf>,
    ) -> Result<()> {
        for artifact in &self.spec.artifacts {
            let cached = fetched
                .get(&artifact.name)
                .ok_or_else(|| anyhow!("artifact '{}' was not fetched", artifact.name))?;

            if artifact.unpack {
                let dest = tree.path_for(&artifact.dest);
                fs::create_dir_all(&dest)
                    .with_context(|| format!("creating {}", dest.display()))?;
                Cmd::new("tar")
                    .arg("-xzf")
                    .arg_path(cached)
                    .arg("-C")
                    .arg_path(&dest)
                    .error_msg(format!("unpacking artifact '{}'", artifact.name))
                    .run()?;
                println!("  Unpacked {} -> {}", artifact.name, artifact.dest);
            } else {
                let mode = artifact.mode.as_deref().map(parse_mode).transpose()?;
                tree.install(cached, &artifact.dest, mode, None)?;
                println!("  Installed {} -> {}", artifact.name, artifact.dest);
            }
        }
        Ok(())
    }

    /// Run the in-chroot commands. A required command failing aborts the
    /// build; best-effort commands log and continue.
    fn configure(&self, tree: &StagedTree) -> Result<(), BuildError> {
        for command in &self.spec.chroot.commands {
            let display = command.argv.join(" ");
            println!("  Running: {display}");

            let output = chroot::run(
                tree.root(),
                &command.argv,
                &self.spec.chroot.env_allow,
                &self.spec.chroot.env,
            )
            .map_err(BuildError::Command)?;

            if output.success() {
                continue;
            }
            if command.best_effort {
                eprintln!(
                    "  [WARN] Best-effort command failed (exit {}): {display}",
                    output.exit_code
                );
                let stderr = output.stderr.trim();
                if !stderr.is_empty() {
                    eprintln!("    {stderr}");
                }
            } else {
                let mut message = format!("'{display}' exited with code {}", output.exit_code);
                let stderr = output.stderr.trim();
                if !stderr.is_empty() {
                    message.push_str(&format!("\n{stderr}"));
                }
                return Err(BuildError::Command(anyhow!(message)));
            }
        }
        Ok(())
    }

    /// Abort cleanup. Only a tree created by this run is removed; a
    /// pre-existing tree the build refused to overwrite stays untouched.
    fn abort(&mut self) {
        self.set_state(BuildState::Aborting);
        if self.tree_created.load(Ordering::SeqCst) {
            cleanup_tree(&self.config.tree_path(), &self.spec.pseudo_filesystems);
        }
        self.set_state(BuildState::Failed);
    }

    fn set_state(&mut self, state: BuildState) {
        self.state = state;
        self.log.push(state.to_string());
        println!("\n=== {state} ===");
    }
}

/// Best-effort cleanup shared by the abort and cancellation paths: unmount
/// pseudo filesystems, then remove the partial tree.
pub fn cleanup_tree(tree: &Path, pseudo_filesystems: &[String]) {
    if let Err(e) = mounts::unmount_pseudo(tree, pseudo_filesystems) {
        eprintln!("  [WARN] Cleanup unmount failed: {e:#}");
    }
    if tree.exists() {
        if let Err(e) = fs::remove_dir_all(tree) {
            eprintln!("  [WARN] Failed to remove {}: {e}", tree.display());
        } else {
            println!("  Removed partial tree {}", tree.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_removes_partial_tree() {
        let temp = tempfile::TempDir::new().unwrap();
        let tree = temp.path().join("rootfs");
        fs::create_dir_all(tree.join("etc")).unwrap();
        fs::write(tree.join("etc/hostname"), "sector\n").unwrap();

        cleanup_tree(&tree, &["proc".to_string()]);
        assert!(!tree.exists());
    }

    #[test]
    fn cleanup_is_safe_without_a_tree() {
        let temp = tempfile::TempDir::new().unwrap();
        cleanup_tree(&temp.path().join("never-created"), &[]);
    }
}
