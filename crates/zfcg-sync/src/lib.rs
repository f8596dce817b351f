//! Crawl pipeline, digest notification and the live schedule.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, warn};
use zfcg_adapters::{FetchLoopConfig, SiteProfile, BROWSER_USER_AGENT};
use zfcg_core::{AdapterKind, Richness, WebPage};

pub mod notify;
pub mod orchestrator;
pub mod pipeline;

pub use notify::{render_digest, Digest, DigestFileNotifier, Notifier};
pub use orchestrator::{JobKind, Orchestrator, ScheduledJob};
pub use pipeline::{CrawlPipeline, CrawlRunSummary};

pub const CRATE_NAME: &str = "zfcg-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Six-field cron expression of the keyword sweep.
    pub sweep_cron: String,
    /// Register one daily crawl per monitor configuration row.
    pub schedule_monitor_jobs: bool,
    pub search_days: u32,
    /// Listing entries older than this many days are dropped; 0 disables.
    pub listing_cutoff_days: u32,
    pub page_delay_ms: u64,
    pub detail_delay_ms: u64,
    pub sweep_richness: Richness,
    pub monitor_richness: Richness,
    pub reports_dir: PathBuf,
    pub export_results: bool,
    pub startup_sweep_delay_secs: u64,
    pub adapters_file: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any key lookup, falling back to the
    /// defaults for missing or unparseable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let richness = |name: &str, default: Richness| {
            lookup(name)
                .and_then(|v| match Richness::from_str(&v) {
                    Ok(r) => Some(r),
                    Err(err) => {
                        warn!(name, error = %err, "ignoring invalid richness");
                        None
                    }
                })
                .unwrap_or(default)
        };
        let flag = |name: &str, default: bool| {
            lookup(name)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://./monitor.db".to_string()),
            http_timeout_secs: parsed("ZFCG_HTTP_TIMEOUT_SECS").unwrap_or(30),
            user_agent: lookup("ZFCG_USER_AGENT")
                .unwrap_or_else(|| BROWSER_USER_AGENT.to_string()),
            sweep_cron: lookup("ZFCG_SWEEP_CRON").unwrap_or_else(|| "0 */10 * * * *".to_string()),
            schedule_monitor_jobs: flag("ZFCG_SCHEDULE_MONITOR_JOBS", true),
            search_days: parsed("ZFCG_SEARCH_DAYS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(1),
            listing_cutoff_days: parsed("ZFCG_LISTING_CUTOFF_DAYS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(30),
            page_delay_ms: parsed("ZFCG_PAGE_DELAY_MS").unwrap_or(500),
            detail_delay_ms: parsed("ZFCG_DETAIL_DELAY_MS").unwrap_or(200),
            sweep_richness: richness("ZFCG_SWEEP_RICHNESS", Richness::Rich),
            monitor_richness: richness("ZFCG_MONITOR_RICHNESS", Richness::Basic),
            reports_dir: lookup("ZFCG_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            export_results: flag("ZFCG_EXPORT_RESULTS", false),
            startup_sweep_delay_secs: parsed("ZFCG_STARTUP_SWEEP_DELAY_SECS").unwrap_or(2),
            adapters_file: lookup("ZFCG_ADAPTERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("adapters.yaml")),
        }
    }

    pub fn fetch_loop(&self, richness: Richness) -> FetchLoopConfig {
        FetchLoopConfig {
            richness,
            page_delay: Duration::from_millis(self.page_delay_ms),
            detail_delay: Duration::from_millis(self.detail_delay_ms),
            ..FetchLoopConfig::default()
        }
    }
}

/// Which request dialect crawls which web page, plus site overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdapterRegistry {
    pub default_kind: AdapterKind,
    pub site: SiteProfile,
    pub pages: Vec<PageAdapter>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self {
            default_kind: AdapterKind::Listing,
            site: SiteProfile::default(),
            pages: Vec::new(),
        }
    }
}

/// Registry entry. Matches a web page by id, or by name when no id is given.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageAdapter {
    #[serde(default)]
    pub web_page_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: AdapterKind,
}

impl AdapterRegistry {
    /// Reads the registry file; a missing file yields the default registry.
    pub async fn load(path: &Path) -> Result<Self> {
        let exists = fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if !exists {
            debug!(path = %path.display(), "no adapter registry, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn kind_for(&self, page: &WebPage) -> AdapterKind {
        self.pages
            .iter()
            .find(|p| p.web_page_id == Some(page.id))
            .or_else(|| {
                self.pages
                    .iter()
                    .find(|p| {
                        p.web_page_id.is_none() && p.name.as_deref() == Some(page.name.as_str())
                    })
            })
            .map(|p| p.kind)
            .unwrap_or(self.default_kind)
    }
}
