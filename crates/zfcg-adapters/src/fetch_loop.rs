//! Paginated crawls for the three request dialects.
//!
//! Loops are strictly sequential and paced by fixed sleeps. A transport
//! failure skips the page; a decode failure ends the loop because the dialect
//! is unusable for this attempt. Neither is returned as an error: the
//! [`CrawlReport`] records what happened.

use std::time::Duration;

use chrono::{Days, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info, warn};
use zfcg_core::{AdapterKind, AnnouncementDraft, Richness, UNKNOWN_PUBLISHER};

use crate::extract::{
    accept_publisher, clean_markup, extract_detail, extract_listing, normalize_date,
    parse_publish_date, publisher_from_free_text,
};
use crate::matcher::KeywordMatcher;
use crate::site::SiteProfile;
use crate::transport::{FormApiRecord, SearchRecord, SearchRequest, SiteTransport};
use crate::AdapterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchLoopConfig {
    pub richness: Richness,
    pub page_delay: Duration,
    pub detail_delay: Duration,
    pub search_page_size: u32,
    pub search_max_pages: u32,
    pub listing_max_pages: u32,
    pub form_page_size: u32,
    pub form_max_pages: u32,
}

impl Default for FetchLoopConfig {
    fn default() -> Self {
        Self {
            richness: Richness::Basic,
            page_delay: Duration::from_millis(500),
            detail_delay: Duration::from_millis(200),
            search_page_size: 50,
            search_max_pages: 10,
            listing_max_pages: 20,
            form_page_size: 20,
            form_max_pages: 10,
        }
    }
}

/// Why a loop stopped paginating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Declared total was zero.
    NoResults,
    /// Cumulative records reached the declared total.
    Exhausted,
    EmptyPage,
    /// Fewer rows than requested.
    ShortPage,
    PageCeiling,
    /// No entry on the page fell inside the date cutoff.
    OutsideWindow,
    /// The dialect answered with something other than its format.
    Unavailable,
    /// The API reported a non-success code.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub kind: AdapterKind,
    pub drafts: Vec<AnnouncementDraft>,
    pub pages_requested: u32,
    pub records_seen: usize,
    pub failed_pages: Vec<u32>,
    pub stop: StopReason,
}

impl CrawlReport {
    fn new(kind: AdapterKind) -> Self {
        Self {
            kind,
            drafts: Vec::new(),
            pages_requested: 0,
            records_seen: 0,
            failed_pages: Vec::new(),
            stop: StopReason::PageCeiling,
        }
    }
}

/// Publish-time window of a search crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl SearchWindow {
    pub fn last_days(days: u32, now: NaiveDateTime) -> Self {
        Self {
            start: now
                .checked_sub_days(Days::new(u64::from(days)))
                .unwrap_or(now),
            end: now,
        }
    }
}

/// Everything a single crawl needs besides the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlPlan {
    pub kind: AdapterKind,
    pub site: SiteProfile,
    pub matcher: KeywordMatcher,
    pub search_window: SearchWindow,
    /// Listing entries published before this day are dropped.
    pub listing_cutoff: Option<NaiveDate>,
}

pub async fn run_crawl(
    transport: &dyn SiteTransport,
    plan: &CrawlPlan,
    config: &FetchLoopConfig,
) -> Result<CrawlReport, AdapterError> {
    match plan.kind {
        AdapterKind::Search => Ok(crawl_search(
            transport,
            &plan.site,
            &plan.matcher,
            plan.search_window,
            config,
        )
        .await),
        AdapterKind::Listing => Ok(crawl_listing(
            transport,
            &plan.site,
            &plan.matcher,
            plan.listing_cutoff,
            config,
        )
        .await),
        AdapterKind::FormApi => crawl_form_api(transport, &plan.site, &plan.matcher, config).await,
    }
}

/// Fetches a detail page and merges what it yields into `draft`. Listing
/// fields are kept when the page is unavailable.
async fn apply_detail(
    transport: &dyn SiteTransport,
    draft: &mut AnnouncementDraft,
) -> Result<(), AdapterError> {
    let html = transport.fetch_page(&draft.url).await?;
    let fields = extract_detail(&html)?;
    if draft.title.trim().is_empty() {
        if let Some(title) = fields.title {
            draft.title = title;
        }
    }
    if draft.content.is_none() {
        draft.content = fields.content;
    }
    if draft.acceptable_publisher().is_none() {
        let resolved = (fields.publisher.value, fields.publisher.strategy);
        if let (Some(publisher), Some(strategy)) = resolved {
            draft.publisher = Some(publisher);
            draft.publisher_strategy = Some(strategy);
        }
    }
    Ok(())
}

async fn enrich_with_detail(
    transport: &dyn SiteTransport,
    draft: &mut AnnouncementDraft,
    config: &FetchLoopConfig,
) {
    if let Err(err) = apply_detail(transport, draft).await {
        warn!(url = %draft.url, error = %err, "detail page unavailable, keeping listing fields");
    }
    tokio::time::sleep(config.detail_delay).await;
}

fn text_or_none(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

async fn search_record_draft(
    transport: &dyn SiteTransport,
    site: &SiteProfile,
    record: &SearchRecord,
    config: &FetchLoopConfig,
) -> AnnouncementDraft {
    let mut draft = AnnouncementDraft::new(
        clean_markup(&record.title),
        site.complete_url(&record.linkurl),
        normalize_date(&record.webdate),
    );
    draft.content = text_or_none(clean_markup(&record.content));

    if config.richness.fetches_details() {
        enrich_with_detail(transport, &mut draft, config).await;
    }
    if draft.acceptable_publisher().is_none() {
        match publisher_from_free_text(&record.content) {
            Some(publisher) => {
                draft.publisher = Some(publisher);
                draft.publisher_strategy = Some("record_free_text".to_string());
            }
            None => {
                draft.publisher = Some(UNKNOWN_PUBLISHER.to_string());
                draft.publisher_strategy = None;
            }
        }
    }
    draft
}

/// JSON search dialect, paginated by result-window offset.
pub async fn crawl_search(
    transport: &dyn SiteTransport,
    site: &SiteProfile,
    matcher: &KeywordMatcher,
    window: SearchWindow,
    config: &FetchLoopConfig,
) -> CrawlReport {
    let mut report = CrawlReport::new(AdapterKind::Search);
    let phrase = matcher.search_phrase();
    let page_size = config.search_page_size.max(1);
    let mut retrieved: u64 = 0;

    for page in 0..config.search_max_pages {
        if page > 0 {
            tokio::time::sleep(config.page_delay).await;
        }
        let request = SearchRequest::new(&phrase, page, page_size, window.start, window.end);
        report.pages_requested += 1;
        let response = match transport.search(&request).await {
            Ok(response) => response,
            Err(err) if err.is_decode() => {
                warn!(page = page + 1, error = %err, "search dialect unavailable");
                report.stop = StopReason::Unavailable;
                return report;
            }
            Err(err) => {
                warn!(page = page + 1, error = %err, "search page failed, skipping");
                report.failed_pages.push(page + 1);
                continue;
            }
        };

        let total = response.result.totalcount;
        if total == 0 {
            report.stop = StopReason::NoResults;
            return report;
        }
        let records = response.result.records;
        report.records_seen += records.len();
        retrieved += records.len() as u64;

        for record in &records {
            let draft = search_record_draft(transport, site, record, config).await;
            if matcher.matches_draft(&draft) {
                debug!(title = %draft.title, publisher = ?draft.publisher, "search record matched");
                report.drafts.push(draft);
            }
        }

        if u64::from(page) * u64::from(page_size) + records.len() as u64 >= total
            || retrieved >= total
        {
            report.stop = StopReason::Exhausted;
            return report;
        }
        if records.is_empty() {
            report.stop = StopReason::EmptyPage;
            return report;
        }
    }
    info!(pages = report.pages_requested, "search page ceiling reached");
    report
}

/// HTML listing dialect plus optional detail pages.
pub async fn crawl_listing(
    transport: &dyn SiteTransport,
    site: &SiteProfile,
    matcher: &KeywordMatcher,
    cutoff: Option<NaiveDate>,
    config: &FetchLoopConfig,
) -> CrawlReport {
    let mut report = CrawlReport::new(AdapterKind::Listing);

    for page in 1..=config.listing_max_pages {
        if page > 1 {
            tokio::time::sleep(config.page_delay).await;
        }
        let url = site.listing_page_url(page);
        report.pages_requested += 1;
        let html = match transport.fetch_page(&url).await {
            Ok(html) => html,
            Err(err) if err.is_decode() => {
                warn!(%url, error = %err, "listing dialect unavailable");
                report.stop = StopReason::Unavailable;
                return report;
            }
            Err(err) => {
                warn!(%url, error = %err, "listing page failed, skipping");
                report.failed_pages.push(page);
                continue;
            }
        };

        let entries = match extract_listing(&html) {
            Ok(resolution) => resolution.value.unwrap_or_default(),
            Err(err) => {
                warn!(%url, error = %err, "listing page could not be parsed");
                report.stop = StopReason::Unavailable;
                return report;
            }
        };
        if entries.is_empty() {
            report.stop = StopReason::EmptyPage;
            return report;
        }
        report.records_seen += entries.len();

        let mut in_window = 0usize;
        for entry in entries {
            let published = parse_publish_date(&entry.date);
            if let (Some(cutoff), Some(published)) = (cutoff, published) {
                if published < cutoff {
                    continue;
                }
            }
            in_window += 1;

            let mut draft = AnnouncementDraft::new(
                entry.title,
                site.complete_url(&entry.href),
                normalize_date(&entry.date),
            );
            if config.richness.fetches_details() {
                enrich_with_detail(transport, &mut draft, config).await;
            }
            if matcher.matches_draft(&draft) {
                report.drafts.push(draft);
            }
        }

        if in_window == 0 {
            debug!(page, "no listing entry inside the cutoff");
            report.stop = StopReason::OutsideWindow;
            return report;
        }
    }
    report
}

fn form_record_draft(site: &SiteProfile, record: &FormApiRecord) -> Option<AnnouncementDraft> {
    let url = if record.url.trim().is_empty() {
        let id = record.id.trim();
        if id.is_empty() {
            return None;
        }
        site.detail_url_for_id(id)
    } else {
        site.complete_url(&record.url)
    };
    let mut draft = AnnouncementDraft::new(
        clean_markup(&record.purchase_project_name),
        url,
        normalize_date(&record.publish_date),
    );
    if let Some(publisher) = accept_publisher(&record.purchaser) {
        draft.publisher = Some(publisher);
        draft.publisher_strategy = Some("api_purchaser".to_string());
    }
    Some(draft)
}

/// Form-encoded listing API, paginated by page index. A non-success code
/// on the first page is an error; later pages stop the loop with
/// [`StopReason::Rejected`].
pub async fn crawl_form_api(
    transport: &dyn SiteTransport,
    site: &SiteProfile,
    matcher: &KeywordMatcher,
    config: &FetchLoopConfig,
) -> Result<CrawlReport, AdapterError> {
    let mut report = CrawlReport::new(AdapterKind::FormApi);
    let page_size = config.form_page_size.max(1);

    for page in 1..=config.form_max_pages {
        if page > 1 {
            tokio::time::sleep(config.page_delay).await;
        }
        report.pages_requested += 1;
        let response = match transport.query_form_api(page, page_size).await {
            Ok(response) => response,
            Err(err) if err.is_decode() => {
                warn!(page, error = %err, "form api unavailable");
                report.stop = StopReason::Unavailable;
                return Ok(report);
            }
            Err(err) => {
                warn!(page, error = %err, "form api page failed, skipping");
                report.failed_pages.push(page);
                continue;
            }
        };

        if !response.is_success() {
            warn!(page, code = response.code, msg = %response.msg, "form api rejected the request");
            if page == 1 {
                return Err(AdapterError::Message(format!(
                    "form api rejected the first page: code {} {}",
                    response.code, response.msg
                )));
            }
            report.stop = StopReason::Rejected;
            return Ok(report);
        }
        if response.data.is_empty() {
            report.stop = StopReason::EmptyPage;
            return Ok(report);
        }
        report.records_seen += response.data.len();

        for record in &response.data {
            let Some(mut draft) = form_record_draft(site, record) else {
                continue;
            };
            if !matcher.matches(&draft.title, None, Some(&record.purchaser)) {
                continue;
            }
            if config.richness.fetches_details() {
                enrich_with_detail(transport, &mut draft, config).await;
            }
            report.drafts.push(draft);
        }

        if response.data.len() < page_size as usize {
            report.stop = StopReason::ShortPage;
            return Ok(report);
        }
    }
    Ok(report)
}
