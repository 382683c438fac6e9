//! Preflight checks for the build host.
//!
//! Validates host tools and the environment before a build starts. Run with
//! `sectorbuild preflight <spec>` to check everything is ready.

use anyhow::{bail, Result};
use std::fs;

use crate::config::Config;
use crate::spec::BuildSpec;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed - the build will fail.
    Fail,
    /// Check passed but with a warning.
    Warn,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: None,
        }
    }

    pub fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details.to_string()),
        }
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if all checks passed (no failures).
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn fail_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count()
    }

    pub fn print(&self) {
        for check in &self.checks {
            let marker = match check.status {
                CheckStatus::Pass => "[ OK ]",
                CheckStatus::Fail => "[FAIL]",
                CheckStatus::Warn => "[WARN]",
            };
            match &check.details {
                Some(details) => println!("{marker} {} - {details}", check.name),
                None => println!("{marker} {}", check.name),
            }
        }
    }
}

/// Run all preflight checks for a spec.
///
/// `config` is optional so the command works before `CHROOT` is exported;
/// environment checks degrade to warnings in that case.
pub fn run_preflight(spec: &BuildSpec, config: Option<&Config>) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    // Host tools the pipeline always needs.
    let mut tools: Vec<(String, &str)> = vec![
        ("tar".to_string(), "Required to create the image archive"),
        ("mount".to_string(), "Required to bind pseudo filesystems"),
        ("umount".to_string(), "Required to release pseudo filesystems"),
    ];
    if !spec.chroot.commands.is_empty() {
        tools.push(("chroot".to_string(), "Required to run configuration commands"));
    }
    if let Some(base) = &spec.base {
        tools.push((
            base.bootstrapper.clone(),
            "Required to bootstrap the base distribution",
        ));
    }

    for (tool, purpose) in &tools {
        match which::which(tool) {
            Ok(path) => checks.push(CheckResult::pass_with(tool, &path.display().to_string())),
            Err(_) => checks.push(CheckResult::fail(tool, purpose)),
        }
    }

    match config {
        Some(config) => {
            checks.push(CheckResult::pass_with(
                "CHROOT",
                &config.work_dir.display().to_string(),
            ));
            match fs::create_dir_all(&config.cache_dir) {
                Ok(()) => checks.push(CheckResult::pass_with(
                    "artifact cache",
                    &config.cache_dir.display().to_string(),
                )),
                Err(e) => checks.push(CheckResult::fail(
                    "artifact cache",
                    &format!("cannot create {}: {e}", config.cache_dir.display()),
                )),
            }
        }
        None => checks.push(CheckResult::warn(
            "CHROOT",
            "not set; export CHROOT before building",
        )),
    }

    println!();
    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(spec: &BuildSpec, config: Option<&Config>) -> Result<()> {
    let report = run_preflight(spec, config);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
