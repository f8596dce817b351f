use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use zfcg_adapters::{
    run_crawl, CrawlPlan, CrawlReport, HttpSiteTransport, KeywordMatcher, SearchWindow,
    SiteTransport, StopReason,
};
use zfcg_core::{AdapterKind, MonitorConfig, Richness, Subscriber, DEFAULT_KEYWORD};
use zfcg_storage::{AnnouncementStore, HttpClientConfig, HttpFetcher};

use crate::notify::{render_digest, Notifier};
use crate::{AdapterRegistry, SyncConfig};

/// Outcome of one crawl plus its persistence.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub label: String,
    pub kind: AdapterKind,
    pub web_page_id: Option<i64>,
    pub pages_requested: u32,
    pub records_seen: usize,
    pub failed_pages: Vec<u32>,
    pub stop: StopReason,
    pub matched: usize,
    pub inserted: usize,
    pub enriched: usize,
    pub skipped: usize,
    pub export_path: Option<String>,
}

/// Runs crawls against the portal and persists what they find.
pub struct CrawlPipeline {
    config: SyncConfig,
    store: AnnouncementStore,
    transport: Arc<dyn SiteTransport>,
    registry: AdapterRegistry,
}

impl CrawlPipeline {
    pub fn new(
        config: SyncConfig,
        store: AnnouncementStore,
        transport: Arc<dyn SiteTransport>,
        registry: AdapterRegistry,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            registry,
        }
    }

    /// Connects the store, loads the adapter registry and builds the HTTP
    /// transport described by `config`.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = AdapterRegistry::load(&config.adapters_file).await?;
        let mut store = AnnouncementStore::connect(&config.database_url).await?;
        store.bootstrap_schema().await?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let transport = HttpSiteTransport::new(Arc::new(fetcher), registry.site.clone());
        Ok(Self::new(config, store, Arc::new(transport), registry))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &AnnouncementStore {
        &self.store
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Keyword search over every monitor configuration. Without any
    /// configuration the first web page and the keyword table are used.
    pub async fn execute_sweep(&self) -> Result<Vec<CrawlRunSummary>> {
        let configs = self
            .store
            .monitor_configs()
            .await
            .context("loading monitor configs for sweep")?;

        if configs.is_empty() {
            let Some(page) = self.store.first_web_page().await? else {
                info!("no web page configured, skipping sweep");
                return Ok(Vec::new());
            };
            let mut keywords = self.store.keywords().await?;
            if keywords.is_empty() {
                keywords.push(DEFAULT_KEYWORD.to_string());
            }
            info!(page = %page.name, ?keywords, "no monitor configs, sweeping with defaults");
            let summary = self
                .run_plan(
                    format!("sweep:{}", page.name),
                    self.search_plan(&keywords),
                    Some(page.id),
                    self.config.sweep_richness,
                )
                .await?;
            return Ok(vec![summary]);
        }

        let mut summaries = Vec::with_capacity(configs.len());
        for config in &configs {
            let label = format!("sweep:{}", config.web_page.name);
            match self
                .run_plan(
                    label,
                    self.search_plan(&config.keywords),
                    Some(config.web_page.id),
                    self.config.sweep_richness,
                )
                .await
            {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    warn!(config_id = config.id, error = %err, "sweep failed for monitor config")
                }
            }
        }
        Ok(summaries)
    }

    /// Crawls one configured web page with the dialect the registry assigns it.
    pub async fn run_monitor_task(&self, config: &MonitorConfig) -> Result<CrawlRunSummary> {
        let cutoff = match self.config.listing_cutoff_days {
            0 => None,
            days => Local::now()
                .date_naive()
                .checked_sub_days(Days::new(u64::from(days))),
        };
        let plan = CrawlPlan {
            kind: self.registry.kind_for(&config.web_page),
            site: self.registry.site.for_listing_url(&config.web_page.url),
            matcher: KeywordMatcher::new(&config.keywords),
            search_window: self.search_window(),
            listing_cutoff: cutoff,
        };
        self.run_plan(
            format!("monitor:{}", config.id),
            plan,
            Some(config.web_page.id),
            self.config.monitor_richness,
        )
        .await
    }

    /// Runs [`Self::run_monitor_task`] for the configuration with `config_id`.
    pub async fn run_monitor_task_by_id(&self, config_id: i64) -> Result<CrawlRunSummary> {
        let configs = self.store.monitor_configs().await?;
        let config = configs
            .iter()
            .find(|c| c.id == config_id)
            .with_context(|| format!("no monitor config with id {config_id}"))?;
        self.run_monitor_task(config).await
    }

    /// Sends today's digest to every subscriber whose push hour is `hour`.
    pub async fn notify_subscribers(&self, hour: u32, notifier: &dyn Notifier) -> Result<usize> {
        let recipients: Vec<Subscriber> = self
            .store
            .subscribers()
            .await?
            .into_iter()
            .filter(|s| s.push_hour == hour)
            .collect();
        if recipients.is_empty() {
            info!(hour, "no subscribers for this hour");
            return Ok(0);
        }
        self.notify_recipients(Utc::now().date_naive(), &recipients, notifier)
            .await
    }

    /// Delivers the digest of rows created on `day` to each recipient.
    /// Returns how many deliveries succeeded.
    pub async fn notify_recipients(
        &self,
        day: NaiveDate,
        recipients: &[Subscriber],
        notifier: &dyn Notifier,
    ) -> Result<usize> {
        let rows = self.store.announcements_created_on(day).await?;
        let Some(digest) = render_digest(&rows) else {
            info!(%day, "no new announcements, nothing to send");
            return Ok(0);
        };
        let mut sent = 0;
        for recipient in recipients {
            match notifier.notify(&recipient.email, &digest).await {
                Ok(()) => {
                    sent += 1;
                    info!(email = %recipient.email, count = digest.count, "digest sent");
                }
                Err(err) => warn!(email = %recipient.email, error = %err, "digest delivery failed"),
            }
        }
        Ok(sent)
    }

    fn search_window(&self) -> SearchWindow {
        SearchWindow::last_days(self.config.search_days, Local::now().naive_local())
    }

    fn search_plan(&self, keywords: &[String]) -> CrawlPlan {
        CrawlPlan {
            kind: AdapterKind::Search,
            site: self.registry.site.clone(),
            matcher: KeywordMatcher::new(keywords),
            search_window: self.search_window(),
            listing_cutoff: None,
        }
    }

    async fn run_plan(
        &self,
        label: String,
        plan: CrawlPlan,
        web_page_id: Option<i64>,
        richness: Richness,
    ) -> Result<CrawlRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("crawl_run", %run_id, %label, kind = %plan.kind);

        async move {
            let report = run_crawl(
                self.transport.as_ref(),
                &plan,
                &self.config.fetch_loop(richness),
            )
            .await
            .with_context(|| format!("crawling {label}"))?;
            info!(
                pages = report.pages_requested,
                records = report.records_seen,
                matched = report.drafts.len(),
                stop = ?report.stop,
                "crawl finished"
            );

            let upsert = self
                .store
                .upsert_announcements(&report.drafts, web_page_id, richness.upsert_mode())
                .await
                .with_context(|| format!("saving announcements for {label}"))?;
            info!(
                inserted = upsert.inserted,
                enriched = upsert.enriched,
                skipped = upsert.skipped,
                "announcements saved"
            );

            let export_path = if self.config.export_results {
                Some(self.export_results(run_id, &label, &report).await?)
            } else {
                None
            };

            Ok::<_, anyhow::Error>(CrawlRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                label,
                kind: report.kind,
                web_page_id,
                pages_requested: report.pages_requested,
                records_seen: report.records_seen,
                failed_pages: report.failed_pages,
                stop: report.stop,
                matched: report.drafts.len(),
                inserted: upsert.inserted,
                enriched: upsert.enriched,
                skipped: upsert.skipped,
                export_path: export_path.map(|p| p.display().to_string()),
            })
        }
        .instrument(span)
        .await
    }

    async fn export_results(
        &self,
        run_id: Uuid,
        label: &str,
        report: &CrawlReport,
    ) -> Result<PathBuf> {
        let run_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": run_id,
            "label": label,
            "kind": report.kind,
            "stop": report.stop,
            "announcements": report.drafts,
        }))
        .context("serializing crawl results")?;
        let path = run_dir.join("announcements.json");
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use zfcg_adapters::transport::SearchResult;
    use zfcg_adapters::{
        AdapterError, FormApiRecord, FormApiResponse, SearchRecord, SearchRequest, SearchResponse,
    };

    use crate::notify::Digest;
    use crate::PageAdapter;

    #[derive(Default)]
    struct PortalStub {
        phrases: Mutex<Vec<String>>,
        form_calls: Mutex<u32>,
    }

    #[async_trait]
    impl SiteTransport for PortalStub {
        async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
            Err(AdapterError::Transport(format!("offline: {url}")))
        }

        async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, AdapterError> {
            self.phrases.lock().expect("lock").push(request.wd.clone());
            if request.pn > 0 {
                return Ok(SearchResponse::default());
            }
            Ok(SearchResponse {
                result: SearchResult {
                    totalcount: 2,
                    records: vec![
                        SearchRecord {
                            title: "<em>生态环境局</em>空气站运维采购公告".to_string(),
                            content: "采购人：深圳市生态环境局，现公开招标".to_string(),
                            webdate: "2024-03-01 10:00:00".to_string(),
                            linkurl: "/gsgg/002001/002001002/20240301/a1.html".to_string(),
                        },
                        SearchRecord {
                            title: "教育局课桌椅采购".to_string(),
                            content: "采购人：深圳市教育局".to_string(),
                            webdate: "2024-03-01".to_string(),
                            linkurl: "/gsgg/002001/002001002/20240301/a2.html".to_string(),
                        },
                    ],
                },
            })
        }

        async fn query_form_api(
            &self,
            page_index: u32,
            _page_size: u32,
        ) -> Result<FormApiResponse, AdapterError> {
            *self.form_calls.lock().expect("lock") += 1;
            if page_index > 1 {
                return Ok(FormApiResponse::default());
            }
            Ok(FormApiResponse {
                total: 1,
                code: 200,
                msg: String::new(),
                data: vec![FormApiRecord {
                    id: "f00d".to_string(),
                    purchase_project_name: "水质自动监测站建设项目".to_string(),
                    purchaser: "深圳市生态环境局".to_string(),
                    publish_date: "2024-03-02 09:00:00".to_string(),
                    url: String::new(),
                    purchase_agent: String::new(),
                }],
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, Digest)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, recipient: &str, digest: &Digest) -> Result<()> {
            if recipient.starts_with("bounce") {
                anyhow::bail!("mailbox unavailable");
            }
            self.sent
                .lock()
                .expect("lock")
                .push((recipient.to_string(), digest.clone()));
            Ok(())
        }
    }

    async fn pipeline_with(
        dir: &tempfile::TempDir,
        registry: AdapterRegistry,
        transport: Arc<PortalStub>,
    ) -> CrawlPipeline {
        let url = format!("sqlite://{}", dir.path().join("monitor.db").display());
        let mut store = AnnouncementStore::connect(&url).await.expect("connect");
        store.bootstrap_schema().await.expect("schema");
        let config = SyncConfig {
            database_url: url,
            page_delay_ms: 0,
            detail_delay_ms: 0,
            sweep_richness: Richness::Basic,
            reports_dir: dir.path().join("reports"),
            ..SyncConfig::default()
        };
        CrawlPipeline::new(config, store, transport, registry)
    }

    async fn seed(pipeline: &CrawlPipeline, sql: &str) {
        sqlx::raw_sql(sql)
            .execute(pipeline.store().pool())
            .await
            .expect("seed");
    }

    #[tokio::test]
    async fn sweep_without_configs_uses_first_page_and_keyword_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(PortalStub::default());
        let pipeline = pipeline_with(&dir, AdapterRegistry::default(), transport.clone()).await;
        seed(
            &pipeline,
            "INSERT INTO web_pages (id, url, name) VALUES (5, 'http://zfcg.szggzy.com:8081/gsgg/secondPage.html', '深圳政府采购');
             INSERT INTO keywords (keyword) VALUES ('生态环境局');
             INSERT INTO keywords (keyword) VALUES ('水务局');",
        )
        .await;

        let summaries = pipeline.execute_sweep().await.expect("sweep");

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].kind, AdapterKind::Search);
        assert_eq!(summaries[0].stop, StopReason::Exhausted);
        assert_eq!(summaries[0].inserted, 1);
        assert_eq!(summaries[0].web_page_id, Some(5));
        assert_eq!(
            transport.phrases.lock().expect("lock").first().map(String::as_str),
            Some("生态环境局 水务局")
        );

        let rows = pipeline
            .store()
            .announcements_created_on(Utc::now().date_naive())
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "生态环境局空气站运维采购公告");
        assert_eq!(rows[0].web_page_name.as_deref(), Some("深圳政府采购"));
    }

    #[tokio::test]
    async fn sweep_without_any_web_page_does_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(PortalStub::default());
        let pipeline = pipeline_with(&dir, AdapterRegistry::default(), transport.clone()).await;

        assert!(pipeline.execute_sweep().await.expect("sweep").is_empty());
        assert!(transport.phrases.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn monitor_task_uses_registry_kind_and_exports_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(PortalStub::default());
        let registry = AdapterRegistry {
            pages: vec![PageAdapter {
                web_page_id: Some(1),
                name: None,
                kind: AdapterKind::FormApi,
            }],
            ..AdapterRegistry::default()
        };
        let mut pipeline = pipeline_with(&dir, registry, transport.clone()).await;
        pipeline.config.export_results = true;
        seed(
            &pipeline,
            "INSERT INTO web_pages (id, url, name) VALUES (1, 'http://zfcg.szggzy.com:8081/gsgg/secondPage.html', '深圳政府采购');
             INSERT INTO monitor_config (web_page_id, crawl_time, crawl_freq, keywords) VALUES (1, '09', 'daily', '生态环境局');",
        )
        .await;
        let configs = pipeline.store().monitor_configs().await.expect("configs");

        let summary = pipeline
            .run_monitor_task_by_id(configs[0].id)
            .await
            .expect("monitor task");

        assert_eq!(summary.kind, AdapterKind::FormApi);
        assert_eq!(summary.stop, StopReason::ShortPage);
        assert_eq!(summary.inserted, 1);
        assert_eq!(*transport.form_calls.lock().expect("lock"), 1);

        let export = summary.export_path.expect("export path");
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&export).expect("read")).expect("json");
        assert_eq!(json["kind"], "form_api");
        assert_eq!(
            json["announcements"][0]["url"],
            "http://zfcg.szggzy.com:8081/gsgg/detail/f00d.html"
        );

        assert!(pipeline.run_monitor_task_by_id(999).await.is_err());
    }

    #[tokio::test]
    async fn notification_reaches_each_recipient_and_survives_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(PortalStub::default());
        let pipeline = pipeline_with(&dir, AdapterRegistry::default(), transport).await;
        seed(
            &pipeline,
            "INSERT INTO subscribe_config (email, push_time) VALUES ('ops@example.com', '8');
             INSERT INTO push_config (email, push_time) VALUES ('bounce@example.com', '08');
             INSERT INTO push_config (email, push_time) VALUES ('late@example.com', '20');",
        )
        .await;
        let notifier = RecordingNotifier::default();

        assert_eq!(pipeline.notify_subscribers(8, &notifier).await.expect("notify"), 0);
        assert!(notifier.sent.lock().expect("lock").is_empty());

        let mut draft = zfcg_core::AnnouncementDraft::new(
            "生态环境局监测设备采购公告",
            "http://zfcg.szggzy.com:8081/gsgg/detail/1.html",
            "2024-03-01",
        );
        draft.publisher = Some("深圳市生态环境局".to_string());
        pipeline
            .store()
            .upsert_announcements(&[draft], None, Richness::Basic.upsert_mode())
            .await
            .expect("upsert");

        assert_eq!(pipeline.notify_subscribers(8, &notifier).await.expect("notify"), 1);
        let sent = notifier.sent.lock().expect("lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ops@example.com");
        assert_eq!(sent[0].1.subject, "政府采购网公告通知 - 1条新公告");
    }
}
