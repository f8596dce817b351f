//! Announcement store + HTTP fetch utilities for the procurement monitor.

use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use zfcg_core::{
    parse_hour, split_keywords, Announcement, AnnouncementDraft, MonitorConfig, Subscriber,
    UpsertMode, WebPage,
};

pub const CRATE_NAME: &str = "zfcg-storage";

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
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    /// Pre-serialized JSON document.
    Json(String),
    Form(Vec<(String, String)>),
}

/// Transport-neutral description of one outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: RequestBody,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_headers(mut self, headers: Vec<(&'static str, String)>) -> Self {
        self.headers.extend(headers);
        self
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
            backoff: config.backoff,
        })
    }

    fn build(&self, request: &OutboundRequest) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }
        match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(doc) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/json;charset=UTF-8")
                .body(doc.clone()),
            RequestBody::Form(fields) => builder.form(fields),
        }
    }

    /// Sends `request`, retrying transient failures with the backoff policy.
    pub async fn send(&self, request: &OutboundRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = ?request.method, url = %request.url);
        self.send_with_retries(request).instrument(span).await
    }

    async fn send_with_retries(
        &self,
        request: &OutboundRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(%status, bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
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
                        warn!(attempt, error = %err, "request failed, retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Idempotent schema used by `migrate` and the tests. Existing tables are left
/// alone; the store adapts to whichever optional columns they carry.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS web_pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS keywords (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    keyword TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS push_config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL,
    push_time TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS monitor_config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    web_page_id INTEGER NOT NULL,
    crawl_time TEXT NOT NULL,
    crawl_freq TEXT NOT NULL DEFAULT 'daily',
    keywords TEXT NOT NULL DEFAULT '',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS subscribe_config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    push_time TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS announcements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    url TEXT NOT NULL UNIQUE,
    publish_date TEXT NOT NULL,
    content TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    web_page_id INTEGER,
    publisher TEXT
);
"#;

/// Optional `announcements` columns detected at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnouncementColumns {
    pub content: bool,
    pub publisher: bool,
    pub web_page_id: bool,
}

/// Per-batch outcome of [`AnnouncementStore::upsert_announcements`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub enriched: usize,
    pub skipped: usize,
}

impl UpsertSummary {
    pub fn absorb(&mut self, other: UpsertSummary) {
        self.inserted += other.inserted;
        self.enriched += other.enriched;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone)]
pub struct AnnouncementStore {
    pool: SqlitePool,
    columns: AnnouncementColumns,
    busy_backoff: BackoffPolicy,
}

const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

impl AnnouncementStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        let columns = probe_columns(&pool).await?;
        debug!(?columns, "announcement columns detected");
        Ok(Self {
            pool,
            columns,
            busy_backoff: BackoffPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(1),
            },
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn columns(&self) -> AnnouncementColumns {
        self.columns
    }

    /// Creates missing tables and re-reads the optional column layout.
    pub async fn bootstrap_schema(&mut self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("creating schema")?;
        self.columns = probe_columns(&self.pool).await?;
        Ok(())
    }

    /// Inserts unseen URLs and enriches existing rows whose publisher improves.
    pub async fn upsert_announcements(
        &self,
        drafts: &[AnnouncementDraft],
        web_page_id: Option<i64>,
        mode: UpsertMode,
    ) -> anyhow::Result<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        for draft in drafts {
            let outcome = self
                .upsert_one(draft, web_page_id, mode)
                .await
                .with_context(|| format!("saving announcement {}", draft.url))?;
            match outcome {
                Outcome::Inserted => summary.inserted += 1,
                Outcome::Enriched => summary.enriched += 1,
                Outcome::Skipped => summary.skipped += 1,
            }
        }
        Ok(summary)
    }

    async fn upsert_one(
        &self,
        draft: &AnnouncementDraft,
        web_page_id: Option<i64>,
        mode: UpsertMode,
    ) -> Result<Outcome, sqlx::Error> {
        let existing = self.existing_publisher(&draft.url).await?;
        let Some((id, stored)) = existing else {
            if self.insert(draft, web_page_id).await? {
                return Ok(Outcome::Inserted);
            }
            // Lost a race with a concurrent insert of the same URL.
            return match self.existing_publisher(&draft.url).await? {
                Some((id, stored)) => self.enrich(id, stored, draft, mode).await,
                None => Ok(Outcome::Skipped),
            };
        };
        self.enrich(id, stored, draft, mode).await
    }

    async fn existing_publisher(
        &self,
        url: &str,
    ) -> Result<Option<(i64, Option<String>)>, sqlx::Error> {
        let sql = if self.columns.publisher {
            "SELECT id, publisher FROM announcements WHERE url = ?"
        } else {
            "SELECT id, NULL AS publisher FROM announcements WHERE url = ?"
        };
        let pool = &self.pool;
        let row = self
            .retry_busy("select announcement", || {
                sqlx::query(sql).bind(url).fetch_optional(pool)
            })
            .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("id")?, row.try_get("publisher")?))),
            None => Ok(None),
        }
    }

    async fn insert(
        &self,
        draft: &AnnouncementDraft,
        web_page_id: Option<i64>,
    ) -> Result<bool, sqlx::Error> {
        let mut columns = vec!["title", "url", "publish_date", "created_at"];
        if self.columns.content {
            columns.push("content");
        }
        if self.columns.web_page_id {
            columns.push("web_page_id");
        }
        if self.columns.publisher {
            columns.push("publisher");
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO announcements ({}) VALUES ({placeholders}) ON CONFLICT(url) DO NOTHING",
            columns.join(", ")
        );
        let created_at = Utc::now().naive_utc().format(CREATED_AT_FORMAT).to_string();
        let publisher = draft.acceptable_publisher();
        let cols = self.columns;
        let pool = &self.pool;
        let result = self
            .retry_busy("insert announcement", || {
                let mut query = sqlx::query(&sql)
                    .bind(draft.title.as_str())
                    .bind(draft.url.as_str())
                    .bind(draft.publish_date.as_str())
                    .bind(created_at.as_str());
                if cols.content {
                    query = query.bind(draft.content.as_deref());
                }
                if cols.web_page_id {
                    query = query.bind(web_page_id);
                }
                if cols.publisher {
                    query = query.bind(publisher);
                }
                query.execute(pool)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn enrich(
        &self,
        id: i64,
        stored: Option<String>,
        draft: &AnnouncementDraft,
        mode: UpsertMode,
    ) -> Result<Outcome, sqlx::Error> {
        if !self.columns.publisher {
            return Ok(Outcome::Skipped);
        }
        let Some(publisher) = draft.acceptable_publisher() else {
            return Ok(Outcome::Skipped);
        };
        if stored.as_deref().map(str::trim) == Some(publisher) {
            return Ok(Outcome::Skipped);
        }

        let pool = &self.pool;
        match mode {
            UpsertMode::PublisherOnly => {
                self.retry_busy("enrich publisher", || {
                    sqlx::query("UPDATE announcements SET publisher = ? WHERE id = ?")
                        .bind(publisher)
                        .bind(id)
                        .execute(pool)
                })
                .await?;
            }
            UpsertMode::FullRefresh => {
                let sql = if self.columns.content {
                    "UPDATE announcements SET title = ?, publish_date = ?, publisher = ?, \
                     content = COALESCE(?, content) WHERE id = ?"
                } else {
                    "UPDATE announcements SET title = ?, publish_date = ?, publisher = ? WHERE id = ?"
                };
                let with_content = self.columns.content;
                self.retry_busy("refresh announcement", || {
                    let mut query = sqlx::query(sql)
                        .bind(draft.title.as_str())
                        .bind(draft.publish_date.as_str())
                        .bind(publisher);
                    if with_content {
                        query = query.bind(draft.content.as_deref());
                    }
                    query.bind(id).execute(pool)
                })
                .await?;
            }
        }
        debug!(url = %draft.url, publisher, ?mode, "enriched announcement");
        Ok(Outcome::Enriched)
    }

    /// Announcements whose `created_at` falls on `day` (UTC), newest first.
    pub async fn announcements_created_on(
        &self,
        day: NaiveDate,
    ) -> anyhow::Result<Vec<Announcement>> {
        let content = if self.columns.content { "a.content" } else { "NULL" };
        let publisher = if self.columns.publisher { "a.publisher" } else { "NULL" };
        let (web_page_id, join) = if self.columns.web_page_id {
            (
                "a.web_page_id",
                "LEFT JOIN web_pages wp ON a.web_page_id = wp.id",
            )
        } else {
            ("NULL", "LEFT JOIN web_pages wp ON 0")
        };
        let sql = format!(
            "SELECT a.id, a.title, a.url, a.publish_date, {content} AS content, \
             {publisher} AS publisher, {web_page_id} AS web_page_id, wp.name AS web_page_name, \
             CAST(a.created_at AS TEXT) AS created_at \
             FROM announcements a {join} \
             WHERE DATE(a.created_at) = ? ORDER BY a.created_at DESC, a.id DESC"
        );
        let day_text = day.format("%Y-%m-%d").to_string();
        let pool = &self.pool;
        let rows = self
            .retry_busy("select today's announcements", || {
                sqlx::query(&sql).bind(day_text.as_str()).fetch_all(pool)
            })
            .await
            .context("reading announcements created today")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.try_get("created_at")?;
            out.push(Announcement {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                url: row.try_get("url")?,
                publish_date: row.try_get("publish_date")?,
                content: row.try_get("content")?,
                publisher: row.try_get("publisher")?,
                web_page_id: row.try_get("web_page_id")?,
                web_page_name: row.try_get("web_page_name")?,
                created_at: parse_created_at(&created_at)
                    .with_context(|| format!("bad created_at value {created_at}"))?,
            });
        }
        Ok(out)
    }

    pub async fn count_announcements(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM announcements")
            .fetch_one(&self.pool)
            .await
            .context("counting announcements")?;
        Ok(row.try_get("n")?)
    }

    /// Monitor configuration rows joined with their web page. Rows pointing at
    /// a missing web page are skipped.
    pub async fn monitor_configs(&self) -> anyhow::Result<Vec<MonitorConfig>> {
        let rows = sqlx::query(
            "SELECT mc.id, mc.web_page_id, mc.crawl_time, mc.crawl_freq, mc.keywords, \
             wp.url AS page_url, wp.name AS page_name \
             FROM monitor_config mc LEFT JOIN web_pages wp ON mc.web_page_id = wp.id \
             ORDER BY mc.id",
        )
        .fetch_all(&self.pool)
        .await
        .context("reading monitor_config")?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let web_page_id: i64 = row.try_get("web_page_id")?;
            let (Some(url), name) = (
                row.try_get::<Option<String>, _>("page_url")?,
                row.try_get::<Option<String>, _>("page_name")?,
            ) else {
                warn!(config_id = id, web_page_id, "monitor config references a missing web page");
                continue;
            };
            let keywords: Option<String> = row.try_get("keywords")?;
            configs.push(MonitorConfig {
                id,
                web_page: WebPage {
                    id: web_page_id,
                    url,
                    name: name.unwrap_or_default(),
                },
                crawl_time: row.try_get("crawl_time")?,
                crawl_freq: row
                    .try_get::<Option<String>, _>("crawl_freq")?
                    .unwrap_or_default(),
                keywords: split_keywords(keywords.as_deref().unwrap_or_default()),
            });
        }
        Ok(configs)
    }

    pub async fn first_web_page(&self) -> anyhow::Result<Option<WebPage>> {
        let row = sqlx::query("SELECT id, url, name FROM web_pages ORDER BY id LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("reading web_pages")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(WebPage {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            name: row.try_get("name")?,
        }))
    }

    pub async fn keywords(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT keyword FROM keywords ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("reading keywords")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let keyword: String = row.try_get("keyword")?;
            let keyword = keyword.trim();
            if !keyword.is_empty() {
                out.push(keyword.to_string());
            }
        }
        Ok(out)
    }

    /// Digest recipients from `subscribe_config` and `push_config`, one entry
    /// per address. `subscribe_config` wins when both tables name an address.
    pub async fn subscribers(&self) -> anyhow::Result<Vec<Subscriber>> {
        let mut by_email: BTreeMap<String, u32> = BTreeMap::new();
        for table in ["push_config", "subscribe_config"] {
            let rows = sqlx::query(&format!("SELECT email, push_time FROM {table} ORDER BY id"))
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("reading {table}"))?;
            for row in rows {
                let email: String = row.try_get("email")?;
                let push_time: String = row.try_get("push_time")?;
                let email = email.trim().to_string();
                match parse_hour(&push_time) {
                    Some(hour) if !email.is_empty() => {
                        by_email.insert(email, hour);
                    }
                    _ => {
                        warn!(table, %email, %push_time, "skipping subscriber with invalid push hour")
                    }
                }
            }
        }
        Ok(by_email
            .into_iter()
            .map(|(email, push_hour)| Subscriber { email, push_hour })
            .collect())
    }

    async fn retry_busy<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, sqlx::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if is_busy(&err) && attempt < self.busy_backoff.max_retries => {
                    let delay = self.busy_backoff.delay_for_attempt(attempt);
                    warn!(what, attempt, ?delay, "database busy, retrying statement");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Inserted,
    Enriched,
    Skipped,
}

async fn probe_columns(pool: &SqlitePool) -> anyhow::Result<AnnouncementColumns> {
    let rows = sqlx::query("PRAGMA table_info(announcements)")
        .fetch_all(pool)
        .await
        .context("probing announcements columns")?;
    let mut columns = AnnouncementColumns {
        content: false,
        publisher: false,
        web_page_id: false,
    };
    for row in rows {
        let name: String = row.try_get("name")?;
        match name.as_str() {
            "content" => columns.content = true,
            "publisher" => columns.publisher = true,
            "web_page_id" => columns.web_page_id = true,
            _ => {}
        }
    }
    Ok(columns)
}

/// SQLite BUSY / LOCKED, including their extended result codes.
pub fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
                || db.message().contains("database is locked")
                || db.message().contains("database table is locked")
        }
        _ => false,
    }
}

fn parse_created_at(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use zfcg_core::UNKNOWN_PUBLISHER as UNKNOWN;

    async fn fresh_store(dir: &tempfile::TempDir) -> AnnouncementStore {
        let url = format!("sqlite://{}", dir.path().join("monitor.db").display());
        let mut store = AnnouncementStore::connect(&url).await.expect("connect");
        store.bootstrap_schema().await.expect("schema");
        store
    }

    fn draft(url: &str, publisher: Option<&str>) -> AnnouncementDraft {
        let mut d = AnnouncementDraft::new("生态环境局监测设备采购公告", url, "2024-03-01");
        d.publisher = publisher.map(ToString::to_string);
        d
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn saving_the_same_batch_twice_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let batch = vec![
            draft("http://zfcg.szggzy.com:8081/gsgg/a.html", Some("深圳市生态环境局")),
            draft("http://zfcg.szggzy.com:8081/gsgg/b.html", None),
        ];

        let first = store
            .upsert_announcements(&batch, None, UpsertMode::PublisherOnly)
            .await
            .expect("first save");
        let second = store
            .upsert_announcements(&batch, None, UpsertMode::PublisherOnly)
            .await
            .expect("second save");

        assert_eq!(first.inserted, 2);
        assert_eq!(second, UpsertSummary { inserted: 0, enriched: 0, skipped: 2 });
        assert_eq!(store.count_announcements().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn publisher_is_enriched_but_never_degraded() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let url = "http://zfcg.szggzy.com:8081/gsgg/c.html";

        store
            .upsert_announcements(&[draft(url, None)], None, UpsertMode::PublisherOnly)
            .await
            .expect("insert");
        let enriched = store
            .upsert_announcements(&[draft(url, Some("深圳市生态环境局"))], None, UpsertMode::PublisherOnly)
            .await
            .expect("enrich");
        assert_eq!(enriched.enriched, 1);

        for worse in [Some(""), Some("某某项目"), Some(UNKNOWN), None] {
            let outcome = store
                .upsert_announcements(&[draft(url, worse)], None, UpsertMode::FullRefresh)
                .await
                .expect("degrade attempt");
            assert_eq!(outcome.skipped, 1, "candidate {worse:?} must not overwrite");
        }

        let today = Utc::now().date_naive();
        let rows = store.announcements_created_on(today).await.expect("today");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].publisher.as_deref(), Some("深圳市生态环境局"));
    }

    #[tokio::test]
    async fn full_refresh_rewrites_fields_publisher_only_does_not() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let url = "http://zfcg.szggzy.com:8081/gsgg/d.html";
        store
            .upsert_announcements(&[draft(url, None)], None, UpsertMode::PublisherOnly)
            .await
            .expect("insert");

        let mut renamed = draft(url, Some("深圳市生态环境局"));
        renamed.title = "更正公告".into();
        store
            .upsert_announcements(&[renamed.clone()], None, UpsertMode::PublisherOnly)
            .await
            .expect("publisher only");
        let today = Utc::now().date_naive();
        let rows = store.announcements_created_on(today).await.expect("rows");
        assert_eq!(rows[0].title, "生态环境局监测设备采购公告");

        renamed.publisher = Some("深圳市龙岗区生态环境局".into());
        store
            .upsert_announcements(&[renamed], None, UpsertMode::FullRefresh)
            .await
            .expect("full refresh");
        let rows = store.announcements_created_on(today).await.expect("rows");
        assert_eq!(rows[0].title, "更正公告");
        assert_eq!(rows[0].publisher.as_deref(), Some("深圳市龙岗区生态环境局"));
    }

    #[tokio::test]
    async fn legacy_table_without_optional_columns_still_works() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("legacy.db").display());
        let store = AnnouncementStore::connect(&url).await.expect("connect");
        sqlx::raw_sql(
            "CREATE TABLE web_pages (id INTEGER PRIMARY KEY, url TEXT NOT NULL, name TEXT NOT NULL);
             CREATE TABLE announcements (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 title TEXT NOT NULL,
                 url TEXT NOT NULL UNIQUE,
                 publish_date TEXT NOT NULL,
                 created_at DATETIME DEFAULT CURRENT_TIMESTAMP
             );",
        )
        .execute(store.pool())
        .await
        .expect("legacy schema");
        let store = AnnouncementStore::from_pool(store.pool().clone())
            .await
            .expect("reprobe");
        assert!(!store.columns().publisher);
        assert!(!store.columns().content);

        let summary = store
            .upsert_announcements(
                &[draft("http://zfcg.szggzy.com:8081/gsgg/e.html", Some("深圳市生态环境局"))],
                Some(1),
                UpsertMode::FullRefresh,
            )
            .await
            .expect("save");
        assert_eq!(summary.inserted, 1);

        let rows = store
            .announcements_created_on(Utc::now().date_naive())
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].publisher, None);
    }

    #[tokio::test]
    async fn configuration_reads_join_and_deduplicate() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        sqlx::raw_sql(
            "INSERT INTO web_pages (id, url, name) VALUES (1, 'http://zfcg.szggzy.com:8081/gsgg/002001/002001002/list.html', '深圳政府采购');
             INSERT INTO monitor_config (web_page_id, crawl_time, crawl_freq, keywords) VALUES (1, '09', 'daily', '生态环境局, ,水务局');
             INSERT INTO monitor_config (web_page_id, crawl_time, crawl_freq, keywords) VALUES (42, '10', 'daily', '');
             INSERT INTO keywords (keyword) VALUES ('生态环境局');
             INSERT INTO subscribe_config (email, push_time) VALUES ('ops@example.com', '8');
             INSERT INTO push_config (email, push_time) VALUES ('ops@example.com', '18');
             INSERT INTO push_config (email, push_time) VALUES ('audit@example.com', '25');",
        )
        .execute(store.pool())
        .await
        .expect("seed");

        let configs = store.monitor_configs().await.expect("configs");
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].keywords, vec!["生态环境局", "水务局"]);
        assert_eq!(configs[0].crawl_hour(), Some(9));
        assert_eq!(configs[0].web_page.name, "深圳政府采购");

        assert_eq!(store.keywords().await.expect("keywords"), vec!["生态环境局"]);
        assert_eq!(
            store.first_web_page().await.expect("page").map(|p| p.id),
            Some(1)
        );

        let subscribers = store.subscribers().await.expect("subscribers");
        assert_eq!(
            subscribers,
            vec![Subscriber {
                email: "ops@example.com".into(),
                push_hour: 8
            }]
        );
    }

    #[test]
    fn created_at_parses_sqlite_and_iso_shapes() {
        assert!(parse_created_at("2024-03-01 10:00:00").is_some());
        assert!(parse_created_at("2024-03-01T10:00:00.123").is_some());
        assert!(parse_created_at("2024-03-01").is_some());
        assert!(parse_created_at("yesterday").is_none());
    }
}
