//! Build error taxonomy and exit-code mapping.
//!
//! Most functions in this crate propagate `anyhow::Error` with context. The
//! types here exist at the boundaries where callers need to distinguish
//! failure classes: the process exit code (one per pipeline phase) and the
//! fetcher/stager contracts the orchestrator branches on.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level build failure, one variant per failure class.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Required environment or configuration input is absent or unusable.
    #[error("missing required input: {0}")]
    MissingInput(String),

    /// Artifact download or integrity verification failed after retries.
    #[error("artifact fetch failed")]
    Fetch(#[source] anyhow::Error),

    /// Root creation, bootstrap, mount, or file install failed.
    #[error("staging failed")]
    Staging(#[source] anyhow::Error),

    /// A required in-chroot configuration command exited non-zero.
    #[error("configuration command failed")]
    Command(#[source] anyhow::Error),

    /// Archiving failed, including the mounted-tree invariant check.
    #[error("packaging failed")]
    Packaging(#[source] anyhow::Error),

    /// The build was cancelled before completing.
    #[error("build interrupted")]
    Interrupted,
}

impl BuildError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::MissingInput(_) => 2,
            BuildError::Fetch(_) => 3,
            BuildError::Staging(_) => 4,
            BuildError::Command(_) => 5,
            BuildError::Packaging(_) => 6,
            BuildError::Interrupted => 130,
        }
    }
}

/// Fetcher failures. Integrity mismatches stay distinct from transport
/// errors so retry handling can delete the corrupt file before trying again.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download failed for {url}: {reason}")]
    Http { url: String, reason: String },

    #[error(
        "checksum mismatch for {}\n  Expected: {expected}\n  Actual:   {actual}",
        path.display()
    )]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FetchError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Transient transport failures and checksum mismatches (a fresh download
    /// may be clean) are retryable; everything else fails immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Integrity { .. } => true,
            FetchError::Http { reason, .. } => {
                let msg = reason.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("connection reset")
                    || msg.contains("connection refused")
                    || msg.contains("temporarily unavailable")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("504")
            }
            FetchError::Other(_) => false,
        }
    }
}

/// Stager failures the orchestrator branches on.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("target already exists: {} (refusing to overwrite)", .0.display())]
    AlreadyExists(PathBuf),

    #[error("install source missing: {}", .0.display())]
    MissingSource(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Render an error with its full cause chain, one cause per line.
pub fn report(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("\n  Caused by: {cause}"));
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let errors = [
            BuildError::MissingInput("CHROOT".into()),
            BuildError::Fetch(anyhow::anyhow!("x")),
            BuildError::Staging(anyhow::anyhow!("x")),
            BuildError::Command(anyhow::anyhow!("x")),
            BuildError::Packaging(anyhow::anyhow!("x")),
            BuildError::Interrupted,
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn integrity_errors_are_retryable() {
        let err = FetchError::Integrity {
            path: PathBuf::from("/tmp/x"),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn http_404_is_not_retryable() {
        let err = FetchError::Http {
            url: "http://example.invalid/x".into(),
            reason: "HTTP 404 Not Found".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn http_503_is_retryable() {
        let err = FetchError::Http {
            url: "http://example.invalid/x".into(),
            reason: "HTTP 503 Service Unavailable".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn report_includes_cause_chain() {
        let inner = anyhow::anyhow!("root cause").context("middle layer");
        let err = BuildError::Staging(inner);
        let text = report(&err);
        assert!(text.contains("staging failed"));
        assert!(text.contains("middle layer"));
        assert!(text.contains("root cause"));
    }
}
