//! Sectorbuild - OrbitLab sector-dns appliance image builder.
//!
//! Assembles a minimal root filesystem from a declarative build spec, stages
//! artifacts and configuration into it, runs configuration commands inside a
//! chroot, and packages the result as a checksummed tarball.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use sectorbuild::build::{self, Orchestrator};
use sectorbuild::config::Config;
use sectorbuild::error::{self, BuildError};
use sectorbuild::preflight;
use sectorbuild::spec::BuildSpec;

#[derive(Parser)]
#[command(name = "sectorbuild")]
#[command(about = "OrbitLab sector-dns appliance image builder")]
#[command(
    after_help = "ENVIRONMENT:\n  CHROOT             Work directory (required, must exist and be writable)\n  VERSION            Image version (default: dev)\n  SECTORBUILD_CACHE  Artifact cache directory"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an appliance image from a build spec
    Build {
        /// Path to the TOML build spec
        spec: PathBuf,
    },

    /// Check host tools and environment before building
    Preflight {
        /// Path to the TOML build spec
        spec: PathBuf,
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Build { spec } => cmd_build(&spec).await,
        Commands::Preflight { spec, strict } => cmd_preflight(&spec, strict),
    };
    std::process::exit(code);
}

async fn cmd_build(spec_path: &PathBuf) -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", error::report(&e));
            return e.exit_code();
        }
    };

    let spec = match BuildSpec::load(spec_path) {
        Ok(spec) => spec,
        Err(e) => {
            let e = BuildError::MissingInput(format!("{e:#}"));
            eprintln!("Error: {}", error::report(&e));
            return e.exit_code();
        }
    };

    // The build runs on this task, so Ctrl-C never races it: when the
    // interrupt branch executes, the build future is no longer polled.
    // Cleanup works by path and only touches a tree this run created.
    let tree_path = config.tree_path();
    let pseudo = spec.pseudo_filesystems.clone();

    let orchestrator = Orchestrator::new(config, spec);
    let tree_created = orchestrator.tree_created_flag();

    tokio::select! {
        result = orchestrator.run() => match result {
            Ok(_) => 0,
            Err(e) => {
                eprintln!("Error: {}", error::report(&e));
                e.exit_code()
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, cleaning up...");
            if tree_created.load(Ordering::SeqCst) {
                build::cleanup_tree(&tree_path, &pseudo);
            }
            BuildError::Interrupted.exit_code()
        }
    }
}

fn cmd_preflight(spec_path: &PathBuf, strict: bool) -> i32 {
    let spec = match BuildSpec::load(spec_path) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return BuildError::MissingInput(String::new()).exit_code();
        }
    };

    let config = Config::from_env().ok();

    if strict {
        match preflight::run_preflight_or_fail(&spec, config.as_ref()) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e:#}");
                1
            }
        }
    } else {
        let report = preflight::run_preflight(&spec, config.as_ref());
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to fail the build.");
        }
        0
    }
}
