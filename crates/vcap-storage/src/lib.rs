//! Intermediate blob storage, HTTP fetch utilities, and the destination
//! content store for VCAP.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;
use vcap_core::CaptionedVideo;

pub const CRATE_NAME: &str = "vcap-storage";

/// Filesystem-backed store for partition-keyed intermediate artifacts.
///
/// Keys are slash-separated relative paths. `put` is an atomic overwrite
/// (temp file plus rename), so re-running a stage replaces its previous
/// output for the interval instead of accumulating alongside it.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.resolve(key);
        let parent = path
            .parent()
            .with_context(|| format!("blob key {key} has no parent directory"))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating blob directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp blob file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp blob file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp blob file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp blob {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.resolve(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading blob {}", path.display())),
        }
    }

    /// Lists blob keys directly under `prefix`, sorted by name.
    ///
    /// A prefix nothing was ever written under is an empty listing, not an
    /// error. In-flight temp files are excluded.
    pub async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let dir = self.resolve(prefix.trim_end_matches('/'));
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("listing blobs under {}", dir.display()))
            }
        };

        let base = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing blobs under {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("inspecting blob entry {name}"))?;
            if file_type.is_file() {
                keys.push(format!("{base}{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

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
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Shared HTTP transport with bounded concurrency, optional token-bucket
/// rate limiting, and retry with exponential backoff.
///
/// Callers identify requests by an endpoint label; full URLs carry the API
/// key as a query parameter and are never logged.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
}

impl FetchError {
    /// Wraps a transport error, dropping its URL. Request URLs carry the
    /// API key as a query parameter and must stay out of rendered errors.
    fn request(endpoint: &str, source: reqwest::Error) -> Self {
        FetchError::Request {
            endpoint: endpoint.to_string(),
            source: source.without_url(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
        }
    }
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        endpoint: &str,
        url: Url,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", endpoint);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url.clone()).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| FetchError::request(endpoint, err))?
                            .to_vec();
                        return Ok(FetchedResponse { status, body });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        endpoint: endpoint.to_string(),
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::request(endpoint, err));
                }
            }
        }

        Err(FetchError::request(
            endpoint,
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Outcome counters for one bulk upsert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub attempted: usize,
    pub written: usize,
}

/// Destination store holding one document per `(source, item id)`.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Replace-or-insert every document; counts only rows whose stored
    /// content actually changed.
    async fn upsert_many(&self, items: &[CaptionedVideo]) -> anyhow::Result<UpsertSummary>;
}

/// Postgres-backed [`ContentStore`] keeping whole composite documents as
/// JSONB rows.
#[derive(Debug, Clone)]
pub struct PgContentStore {
    pool: sqlx::PgPool,
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

impl PgContentStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running content store migrations")?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn upsert_many(&self, items: &[CaptionedVideo]) -> anyhow::Result<UpsertSummary> {
        let mut summary = UpsertSummary {
            attempted: items.len(),
            written: 0,
        };
        if items.is_empty() {
            return Ok(summary);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("starting upsert transaction")?;
        for item in items {
            let document = serde_json::to_value(item)
                .with_context(|| format!("serializing document {}", item.record.id))?;
            let result = sqlx::query(
                r#"
                INSERT INTO content_items (source, item_id, document, updated_at)
                VALUES ($1, $2, $3, now())
                ON CONFLICT (source, item_id) DO UPDATE SET
                    document = EXCLUDED.document,
                    updated_at = now()
                WHERE content_items.document IS DISTINCT FROM EXCLUDED.document
                "#,
            )
            .bind(&item.source)
            .bind(item.record.id.as_str())
            .bind(&document)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting document {}", item.record.id))?;
            summary.written += result.rows_affected() as usize;
        }
        tx.commit().await.context("committing upsert transaction")?;
        Ok(summary)
    }
}
