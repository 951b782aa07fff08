//! Detail-page cache on disk + polite HTTP fetch utilities for the portal.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civilview_core::PropertyIdentifier;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "civilview-storage";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Raw detail content for one property as last fetched from the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identifier: PropertyIdentifier,
    pub fetched_at: DateTime<Utc>,
    pub content_sha256: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Expired,
    FromFuture,
}

/// One JSON file per identifier under `root`. Entries are replaced whole via
/// temp-file + rename and read whole in a single call, so a concurrent
/// eviction or rewrite never exposes a partial entry.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    ttl: Duration,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_ttl(root, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn entry_path(&self, identifier: &PropertyIdentifier) -> PathBuf {
        self.root.join(format!("{}.json", identifier.file_stem()))
    }

    fn freshness(&self, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
        match (now - fetched_at).to_std() {
            Ok(age) if age > self.ttl => Freshness::Expired,
            Ok(_) => Freshness::Fresh,
            Err(_) => Freshness::FromFuture,
        }
    }

    pub async fn get(&self, identifier: &PropertyIdentifier) -> Option<CacheEntry> {
        self.get_at(identifier, Utc::now()).await
    }

    /// Returns the entry only if it is intact and no older than the TTL.
    /// Every other outcome is a plain miss.
    pub async fn get_at(
        &self,
        identifier: &PropertyIdentifier,
        now: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        let path = self.entry_path(identifier);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable cache entry");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt cache entry");
                return None;
            }
        };

        if entry.identifier != *identifier {
            warn!(
                path = %path.display(),
                expected = %identifier,
                found = %entry.identifier,
                "cache entry belongs to another identifier"
            );
            return None;
        }
        if Self::sha256_hex(entry.content.as_bytes()) != entry.content_sha256 {
            warn!(path = %path.display(), "cache entry content hash mismatch");
            return None;
        }

        match self.freshness(entry.fetched_at, now) {
            Freshness::Fresh => Some(entry),
            Freshness::Expired => {
                debug!(%identifier, fetched_at = %entry.fetched_at, "cache entry expired");
                None
            }
            Freshness::FromFuture => {
                warn!(%identifier, fetched_at = %entry.fetched_at, "cache entry timestamp is in the future");
                None
            }
        }
    }

    pub async fn put(
        &self,
        identifier: &PropertyIdentifier,
        content: &str,
    ) -> anyhow::Result<CacheEntry> {
        self.put_at(identifier, content, Utc::now()).await
    }

    /// Replaces the entry for `identifier` using an atomic temp-file rename.
    pub async fn put_at(
        &self,
        identifier: &PropertyIdentifier,
        content: &str,
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<CacheEntry> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating cache directory {}", self.root.display()))?;

        let entry = CacheEntry {
            identifier: identifier.clone(),
            fetched_at,
            content_sha256: Self::sha256_hex(content.as_bytes()),
            content: content.to_string(),
        };
        let bytes = serde_json::to_vec(&entry).context("encoding cache entry")?;
        let path = self.entry_path(identifier);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp cache file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(entry)
    }

    pub async fn evict_expired(&self) -> anyhow::Result<usize> {
        self.evict_expired_at(Utc::now()).await
    }

    /// Deletes expired entries, corrupt entries and abandoned temp files whose
    /// mtime is past the TTL. Returns how many files were removed.
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading cache directory {}", self.root.display()))
            }
        };

        let mut removed = 0usize;
        while let Some(item) = dir
            .next_entry()
            .await
            .with_context(|| format!("listing cache directory {}", self.root.display()))?
        {
            let path = item.path();
            let name = item.file_name().to_string_lossy().into_owned();

            let expired = if name.starts_with('.') && name.ends_with(".tmp") {
                self.mtime_expired(&path, now).await
            } else if name.ends_with(".json") {
                match fs::read(&path).await {
                    Ok(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                        Ok(entry) => self.freshness(entry.fetched_at, now) == Freshness::Expired,
                        Err(_) => self.mtime_expired(&path, now).await,
                    },
                    Err(_) => false,
                }
            } else {
                false
            };

            if !expired {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "evicted cache file");
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to evict cache file");
                }
            }
        }
        Ok(removed)
    }

    async fn mtime_expired(&self, path: &Path, now: DateTime<Utc>) -> bool {
        let Ok(meta) = fs::metadata(path).await else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        self.freshness(DateTime::<Utc>::from(modified), now) == Freshness::Expired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `op` receives the zero-based attempt index.
    pub async fn retry<T, E, F, Fut>(
        &self,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0usize;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && is_retryable(&err) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Spaces requests out: each `take` consumes a token, and tokens refill one
/// per `refill_every` up to `capacity`.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            if self.refill_every.is_zero() {
                return;
            }
            let elapsed = state.last_refill.elapsed();
            let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()).min(u32::MAX as u128) as u32;
            if refills > 0 {
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(state.last_refill.elapsed());
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("page at {url} did not render: {reason}")]
    Render { url: String, reason: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Render { .. } => true,
        }
    }
}

/// Anything that can turn a portal URL into rendered HTML. The HTTP fetcher
/// below is one implementation; a headless-browser driver is another.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 3,
            min_request_interval: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Portal fetcher with a cap on in-flight requests, a minimum spacing between
/// requests, and bounded retry on transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    pacer: SimpleTokenBucket,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            pacer: SimpleTokenBucket::new(1, config.min_request_interval),
            backoff: config.backoff,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.pacer.take().await;
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        Ok(FetchedPage {
            url: url.to_string(),
            final_url,
            body,
            fetched_at: Utc::now(),
        })
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", url);
        self.backoff
            .retry(|_| self.fetch_once(url), FetchError::is_retryable)
            .instrument(span)
            .await
    }
}
