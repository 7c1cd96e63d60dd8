//! HTTP fetch plumbing + the opportunity store contract and its backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{CanonicalOpportunity, IngestionLogEntry, NaturalKey, OpportunityStatus, Portal};
use reqwest::StatusCode;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-storage";

/// Schema migrations for the Postgres backend (`migrations/`).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

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
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct PortalClientConfig {
    /// Upper bound for one page request; a hung endpoint fails instead of stalling the run.
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for PortalClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "radar-licitacoes/0.1 (contato@exemplo.com)".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Network/timeout/HTTP-status failure on one page request. Source-local: the
/// driver reacts by advancing to the next source, never by aborting the run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// JSON-speaking GET client for the portal catalogs: fixed timeout, descriptive
/// user agent, exponential backoff on retryable failures.
#[derive(Debug, Clone)]
pub struct PortalClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PortalClient {
    pub fn new(config: PortalClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Fetches one page and parses it as JSON. A syntactically broken body is an
    /// unexpected envelope shape, not a fetch failure: it decays to `Value::Null`
    /// so extraction sees an empty page.
    pub async fn get_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, FetchError> {
        let span = info_span!("portal_fetch", %run_id, source_id, url);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                let result = self
                    .client
                    .get(url)
                    .query(query)
                    .header("Accept", "application/json")
                    .send()
                    .await;

                match result {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.text().await?;
                            return Ok(serde_json::from_str(&body).unwrap_or_else(|err| {
                                warn!(%err, "non-JSON portal response; treating as empty page");
                                Value::Null
                            }));
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(FetchError::Request(
                last_request_error.expect("retry loop captures a request error"),
            ))
        }
        .instrument(span)
        .await
    }
}

/// The store rejected a write or lookup. Propagated for record persistence,
/// swallowed-and-logged only for the audit write itself.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opportunity upsert failed: {0}")]
    Upsert(#[source] sqlx::Error),
    #[error("natural-key lookup failed: {0}")]
    Lookup(#[source] sqlx::Error),
    #[error("ingestion log insert failed: {0}")]
    LogInsert(#[source] sqlx::Error),
    #[error("opportunity query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub was_insert: bool,
}

/// Opaque upsert/query store the pipeline writes into. Two logical collections:
/// `opportunities` (atomic upsert on the natural key, point lookup, trailing-window
/// query) and `ingestion_logs` (append-only insert).
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Single atomic upsert-on-conflict against the natural key; last writer wins
    /// on non-key fields. Classification comes from the write itself, so there is
    /// no lookup round trip and no race window on the reported counts.
    async fn upsert(&self, record: &CanonicalOpportunity) -> Result<UpsertOutcome, StoreError>;

    async fn find_by_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<CanonicalOpportunity>, StoreError>;

    async fn append_log(&self, entry: &IngestionLogEntry) -> Result<(), StoreError>;

    /// Rows touched since `since`, ordered by deadline ascending (dateless rows
    /// last). Feeds the digest job.
    async fn updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<CanonicalOpportunity>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        MIGRATOR.run(&self.pool).await
    }
}

fn row_to_opportunity(row: &PgRow) -> Result<CanonicalOpportunity, sqlx::Error> {
    let portal_raw: String = row.try_get("portal")?;
    let portal = Portal::parse(&portal_raw).ok_or_else(|| sqlx::Error::Decode(
        format!("unknown portal {portal_raw:?}").into(),
    ))?;
    let status_raw: String = row.try_get("status")?;
    let status = OpportunityStatus::parse(&status_raw).ok_or_else(|| sqlx::Error::Decode(
        format!("unknown status {status_raw:?}").into(),
    ))?;

    Ok(CanonicalOpportunity {
        title: row.try_get("title")?,
        portal,
        agency: row.try_get("agency")?,
        state: row.try_get("state")?,
        city: row.try_get("city")?,
        modality: row.try_get("modality")?,
        notice_number: row.try_get("notice_number")?,
        link: row.try_get("link")?,
        deadline_date: row.try_get("deadline_date")?,
        status,
        updated_at: row.try_get("updated_at")?,
    })
}

const OPPORTUNITY_COLUMNS: &str =
    "title, portal, agency, state, city, modality, notice_number, link, deadline_date, status, updated_at";

#[async_trait]
impl OpportunityStore for PgStore {
    async fn upsert(&self, record: &CanonicalOpportunity) -> Result<UpsertOutcome, StoreError> {
        // xmax = 0 distinguishes a fresh insert from a conflict-update in the same
        // atomic statement.
        let row = sqlx::query(
            r#"
            INSERT INTO opportunities
                (title, portal, agency, state, city, modality, notice_number, link,
                 deadline_date, status, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (portal, COALESCE(notice_number, ''), COALESCE(agency, ''))
            DO UPDATE SET
                title = EXCLUDED.title,
                state = EXCLUDED.state,
                city = EXCLUDED.city,
                modality = EXCLUDED.modality,
                link = EXCLUDED.link,
                deadline_date = EXCLUDED.deadline_date,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS was_insert
            "#,
        )
        .bind(&record.title)
        .bind(record.portal.as_str())
        .bind(&record.agency)
        .bind(&record.state)
        .bind(&record.city)
        .bind(&record.modality)
        .bind(&record.notice_number)
        .bind(&record.link)
        .bind(record.deadline_date)
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Upsert)?;

        let was_insert: bool = row.try_get("was_insert").map_err(StoreError::Upsert)?;
        Ok(UpsertOutcome { was_insert })
    }

    async fn find_by_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<CanonicalOpportunity>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {OPPORTUNITY_COLUMNS}
              FROM opportunities
             WHERE portal = $1
               AND COALESCE(notice_number, '') = COALESCE($2, '')
               AND COALESCE(agency, '') = COALESCE($3, '')
            "#
        ))
        .bind(key.portal.as_str())
        .bind(&key.notice_number)
        .bind(&key.agency)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Lookup)?;

        row.as_ref()
            .map(row_to_opportunity)
            .transpose()
            .map_err(StoreError::Lookup)
    }

    async fn append_log(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        let params = serde_json::to_value(&entry.params)
            .map_err(|err| StoreError::Backend(format!("serializing run params: {err}")))?;

        sqlx::query(
            r#"
            INSERT INTO ingestion_logs (source, params, inserted_count, updated_count, degraded, error)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.source)
        .bind(params)
        .bind(entry.inserted_count as i64)
        .bind(entry.updated_count as i64)
        .bind(entry.degraded)
        .bind(&entry.error)
        .execute(&self.pool)
        .await
        .map_err(StoreError::LogInsert)?;
        Ok(())
    }

    async fn updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<CanonicalOpportunity>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OPPORTUNITY_COLUMNS}
              FROM opportunities
             WHERE updated_at >= $1
             ORDER BY deadline_date ASC NULLS LAST
            "#
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        rows.iter()
            .map(row_to_opportunity)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Query)
    }
}

/// In-memory store backing tests: same key semantics as the Postgres index, plus
/// switches to inject write failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<(String, String, String), CanonicalOpportunity>>,
    logs: Mutex<Vec<IngestionLogEntry>>,
    fail_upserts: AtomicBool,
    fail_log_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_log_writes(&self, fail: bool) {
        self.fail_log_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn row_count(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn all_rows(&self) -> Vec<CanonicalOpportunity> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn logged_entries(&self) -> Vec<IngestionLogEntry> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn upsert(&self, record: &CanonicalOpportunity) -> Result<UpsertOutcome, StoreError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected upsert failure".to_string()));
        }
        let mut rows = self.rows.lock().await;
        let was_insert = rows
            .insert(record.natural_key().normalized(), record.clone())
            .is_none();
        Ok(UpsertOutcome { was_insert })
    }

    async fn find_by_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<CanonicalOpportunity>, StoreError> {
        Ok(self.rows.lock().await.get(&key.normalized()).cloned())
    }

    async fn append_log(&self, entry: &IngestionLogEntry) -> Result<(), StoreError> {
        if self.fail_log_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected log failure".to_string()));
        }
        self.logs.lock().await.push(entry.clone());
        Ok(())
    }

    async fn updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<CanonicalOpportunity>, StoreError> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|o| o.updated_at >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| match (a.deadline_date, b.deadline_date) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Ok(rows)
    }
}
