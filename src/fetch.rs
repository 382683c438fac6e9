//! Artifact fetching, verification, and caching.
//!
//! All external artifacts go through this module for consistent:
//! - Integrity verification (SHA-256) before anything is staged
//! - Retry with bounded exponential backoff for transient failures
//! - A local cache keyed by source + checksum so repeated builds skip
//!   the download
//!
//! Sources are HTTP(S) URLs or local paths; local paths are copied into the
//! cache so the rest of the pipeline never touches the original file.

use anyhow::{anyhow, Context};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinSet;

use crate::error::FetchError;
use crate::spec::ArtifactSpec;

/// Upper bound on artifacts fetched in parallel.
pub const MAX_CONCURRENT_FETCHES: usize = 4;

/// Retry and timeout knobs for the fetcher.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Total attempts per artifact, including the first.
    pub attempts: u32,
    /// Base delay between retries; doubles each attempt, capped at 16x.
    pub retry_delay: Duration,
    /// Per-request timeout. None for large downloads.
    pub timeout: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay: Duration::from_secs(2),
            timeout: None,
        }
    }
}

/// Artifact fetcher with a persistent local cache.
#[derive(Debug, Clone)]
pub struct Fetcher {
    cache_dir: PathBuf,
    options: FetchOptions,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            options: FetchOptions::default(),
        }
    }

    pub fn with_options(cache_dir: impl Into<PathBuf>, options: FetchOptions) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            options,
        }
    }

    /// Cache location for an artifact, keyed by source + declared checksum.
    pub fn cache_path(&self, artifact: &ArtifactSpec) -> PathBuf {
        let key = cache_key(&artifact.source, artifact.sha256.as_deref());
        self.cache_dir
            .join(&key[..16])
            .join(source_filename(&artifact.source, &artifact.name))
    }

    /// Fetch one artifact into the cache, returning the cached path.
    ///
    /// A cached file that still verifies is reused without touching the
    /// network. Failed attempts clean up their staging file before retrying,
    /// so the cache path only ever holds complete, verified bytes.
    pub async fn fetch(&self, artifact: &ArtifactSpec) -> Result<PathBuf, FetchError> {
        let dest = self.cache_path(artifact);

        if dest.is_file() {
            match &artifact.sha256 {
                Some(expected) => {
                    if verify_sha256(&dest, expected).is_ok() {
                        return Ok(dest);
                    }
                    // Stale or corrupt cache entry; refetch.
                    let _ = std::fs::remove_file(&dest);
                }
                None => return Ok(dest),
            }
        }

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.options.retry_delay * (1 << (attempt - 1).min(4));
                println!(
                    "    Retry {}/{} for '{}' in {:?}...",
                    attempt,
                    self.options.attempts.saturating_sub(1),
                    artifact.name,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            match self.attempt(artifact, &dest).await {
                Ok(()) => return Ok(dest),
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.options.attempts {
                        return Err(e);
                    }
                    eprintln!("  [WARN] Fetch of '{}' failed: {e}", artifact.name);
                }
            }
        }
    }

    /// Fetch all artifacts, at most [`MAX_CONCURRENT_FETCHES`] in flight.
    ///
    /// Artifacts are independent until staged, so completion order does not
    /// matter; the first failure wins and aborts the remaining tasks. Each
    /// task owns its artifact and fetcher handle, nothing borrows from the
    /// caller.
    pub async fn fetch_all(
        &self,
        artifacts: &[ArtifactSpec],
    ) -> Result<HashMap<String, PathBuf>, FetchError> {
        if artifacts.is_empty() {
            return Ok(HashMap::new());
        }
        println!("Fetching {} artifact(s)...", artifacts.len());

        let mut pending = artifacts.iter().cloned();
        let mut set: JoinSet<Result<(String, PathBuf), FetchError>> = JoinSet::new();
        let mut fetched = HashMap::new();

        loop {
            while set.len() < MAX_CONCURRENT_FETCHES {
                let Some(artifact) = pending.next() else { break };
                let fetcher = self.clone();
                set.spawn(async move {
                    let path = fetcher.fetch(&artifact).await?;
                    Ok((artifact.name, path))
                });
            }
            let Some(joined) = set.join_next().await else { break };
            let (name, path) = joined
                .map_err(|e| FetchError::Other(anyhow!("fetch task failed: {e}")))??;
            println!("  {} -> {}", name, path.display());
            fetched.insert(name, path);
        }
        Ok(fetched)
    }

    /// One fetch attempt. Bytes land in a `.part` file first and only move
    /// to the final cache path after verification, so the cache never holds
    /// a partial download.
    async fn attempt(&self, artifact: &ArtifactSpec, dest: &Path) -> Result<(), FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }

        let staging = part_path(dest);
        if let Err(e) = self.attempt_staged(artifact, &staging).await {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        tokio::fs::rename(&staging, dest)
            .await
            .with_context(|| format!("moving {} into place", staging.display()))?;
        Ok(())
    }

    async fn attempt_staged(
        &self,
        artifact: &ArtifactSpec,
        staging: &Path,
    ) -> Result<(), FetchError> {
        if is_url(&artifact.source) {
            download(&artifact.source, staging, self.options.timeout).await?;
        } else {
            let src = Path::new(&artifact.source);
            if !src.is_file() {
                return Err(FetchError::Other(anyhow!(
                    "artifact source not found: {}",
                    src.display()
                )));
            }
            tokio::fs::copy(src, staging)
                .await
                .with_context(|| format!("copying {} into cache", src.display()))?;
        }

        if let Some(expected) = &artifact.sha256 {
            verify_sha256(staging, expected)?;
        }
        Ok(())
    }
}

/// Stream one HTTP download to `dest`.
async fn download(url: &str, dest: &Path, timeout: Option<Duration>) -> Result<(), FetchError> {
    use tokio::io::AsyncWriteExt;

    let client = reqwest::Client::builder()
        .user_agent(concat!("sectorbuild/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| FetchError::Other(anyhow::Error::new(e)))?;

    let mut request = client.get(url);
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }

    let response = request.send().await.map_err(|e| FetchError::Http {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Http {
            url: url.to_string(),
            reason: format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown")
            ),
        });
    }

    let file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;
    let mut writer = tokio::io::BufWriter::new(file);

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Http {
            url: url.to_string(),
            reason: format!("reading response body: {e}"),
        })?;
        writer
            .write_all(&chunk)
            .await
            .with_context(|| format!("writing {}", dest.display()))?;
    }
    writer
        .flush()
        .await
        .with_context(|| format!("flushing {}", dest.display()))?;

    Ok(())
}

/// Verify the SHA-256 of a file against a lowercase hex digest.
pub fn verify_sha256(path: &Path, expected: &str) -> Result<(), FetchError> {
    let actual = file_sha256(path)?;
    if actual != expected.to_lowercase() {
        return Err(FetchError::Integrity {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Compute the SHA-256 of a file, streamed in 1 MiB chunks.
pub fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening {} for checksum", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("reading {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Cache key for a source + checksum pair.
pub fn cache_key(source: &str, sha256: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"\n");
    hasher.update(sha256.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn part_path(dest: &Path) -> PathBuf {
    match dest.file_name().and_then(|n| n.to_str()) {
        Some(name) => dest.with_file_name(format!("{name}.part")),
        None => dest.with_file_name("download.part"),
    }
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn source_filename(source: &str, fallback: &str) -> String {
    source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
