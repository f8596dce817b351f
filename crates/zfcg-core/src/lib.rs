//! Core domain model for the procurement announcement monitor.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "zfcg-core";

/// Keyword used by the matcher and the free-text publisher heuristic when no
/// keywords are configured.
pub const DEFAULT_KEYWORD: &str = "生态环境局";

/// Publisher sentinel for an exhausted fallback chain.
pub const UNKNOWN_PUBLISHER: &str = "未知单位";

pub const PUBLISHER_MAX_CHARS: usize = 100;

/// Substrings that mean a pattern captured a project or contract name instead
/// of an organization.
pub const PUBLISHER_DISQUALIFIERS: [&str; 2] = ["项目", "合同"];

/// True when `value` is a usable organization name.
pub fn is_acceptable_publisher(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty()
        && value != UNKNOWN_PUBLISHER
        && value.chars().count() <= PUBLISHER_MAX_CHARS
        && !PUBLISHER_DISQUALIFIERS.iter().any(|bad| value.contains(bad))
}

/// Candidate produced by a fetch loop and handed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementDraft {
    pub title: String,
    pub url: String,
    pub publish_date: String,
    pub content: Option<String>,
    pub publisher: Option<String>,
    /// Name of the extraction strategy that produced `publisher`.
    pub publisher_strategy: Option<String>,
}

impl AnnouncementDraft {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        publish_date: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            publish_date: publish_date.into(),
            content: None,
            publisher: None,
            publisher_strategy: None,
        }
    }

    /// Publisher value only when it passes [`is_acceptable_publisher`].
    pub fn acceptable_publisher(&self) -> Option<&str> {
        self.publisher
            .as_deref()
            .map(str::trim)
            .filter(|p| is_acceptable_publisher(p))
    }
}

/// Persisted announcement row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub publish_date: String,
    pub content: Option<String>,
    pub publisher: Option<String>,
    pub web_page_id: Option<i64>,
    pub web_page_name: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebPage {
    pub id: i64,
    pub url: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: i64,
    pub keyword: String,
}

/// Monitor configuration row joined with its web page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub id: i64,
    pub web_page: WebPage,
    /// Hour of day as stored, e.g. `"9"` or `"09"`.
    pub crawl_time: String,
    pub crawl_freq: String,
    pub keywords: Vec<String>,
}

impl MonitorConfig {
    /// Crawl hour when the stored text is a valid hour of day.
    pub fn crawl_hour(&self) -> Option<u32> {
        parse_hour(&self.crawl_time)
    }

    pub fn frequency(&self) -> CrawlFrequency {
        CrawlFrequency::from_tag(&self.crawl_freq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeConfig {
    pub id: i64,
    pub email: String,
    pub push_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushConfig {
    pub id: i64,
    pub email: String,
    pub push_time: String,
}

/// Recipient of the daily digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub email: String,
    pub push_hour: u32,
}

/// Parses a textual hour of day (`"9"`, `"09"`, `" 17 "`).
pub fn parse_hour(text: &str) -> Option<u32> {
    text.trim().parse::<u32>().ok().filter(|h| *h < 24)
}

/// Splits a stored comma-separated keyword list, dropping blank entries.
pub fn split_keywords(stored: &str) -> Vec<String> {
    stored
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlFrequency {
    Daily,
    Unrecognized(String),
}

impl CrawlFrequency {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "" | "daily" => Self::Daily,
            _ => Self::Unrecognized(tag.trim().to_string()),
        }
    }
}

/// Request dialect used to crawl a web page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Paginated HTML listing plus detail pages.
    Listing,
    /// JSON full-text search.
    Search,
    /// Form-encoded listing API.
    FormApi,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Listing => "listing",
            Self::Search => "search",
            Self::FormApi => "form_api",
        })
    }
}

impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "listing" | "html" => Ok(Self::Listing),
            "search" | "api" => Ok(Self::Search),
            "form_api" | "form-api" | "form" => Ok(Self::FormApi),
            other => Err(format!("unknown adapter kind: {other}")),
        }
    }
}

/// How an existing row is updated when a better publisher arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertMode {
    PublisherOnly,
    FullRefresh,
}

/// Strategy richness of one crawl call site.
///
/// `Basic` crawls never fetch detail pages and only backfill the publisher of
/// existing rows; `Rich` crawls resolve publishers from detail pages and
/// refresh every field of a row they enrich.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Richness {
    Basic,
    Rich,
}

impl Richness {
    pub fn fetches_details(self) -> bool {
        matches!(self, Self::Rich)
    }

    pub fn upsert_mode(self) -> UpsertMode {
        match self {
            Self::Basic => UpsertMode::PublisherOnly,
            Self::Rich => UpsertMode::FullRefresh,
        }
    }
}

impl FromStr for Richness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "rich" | "full" => Ok(Self::Rich),
            other => Err(format!("unknown richness: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_rule_rejects_bad_candidates() {
        assert!(is_acceptable_publisher("深圳市生态环境局"));
        assert!(!is_acceptable_publisher(""));
        assert!(!is_acceptable_publisher("   "));
        assert!(!is_acceptable_publisher(UNKNOWN_PUBLISHER));
        assert!(!is_acceptable_publisher("某某项目采购"));
        assert!(!is_acceptable_publisher("合同编号"));
        assert!(!is_acceptable_publisher(&"局".repeat(101)));
        assert!(is_acceptable_publisher(&"局".repeat(100)));
    }

    #[test]
    fn hours_and_keywords_parse_leniently() {
        assert_eq!(parse_hour("9"), Some(9));
        assert_eq!(parse_hour("09"), Some(9));
        assert_eq!(parse_hour("24"), None);
        assert_eq!(parse_hour("nine"), None);
        assert_eq!(split_keywords("生态环境局, 水务局,,"), vec!["生态环境局", "水务局"]);
        assert!(split_keywords("").is_empty());
    }

    #[test]
    fn adapter_kind_and_richness_parse() {
        assert_eq!("form-api".parse::<AdapterKind>(), Ok(AdapterKind::FormApi));
        assert_eq!(AdapterKind::Search.to_string(), "search");
        assert!("rss".parse::<AdapterKind>().is_err());
        assert_eq!(
            "rich".parse::<Richness>().map(Richness::upsert_mode),
            Ok(UpsertMode::FullRefresh)
        );
        assert!(!Richness::Basic.fetches_details());
    }

    #[test]
    fn unknown_frequency_tags_are_kept() {
        assert_eq!(CrawlFrequency::from_tag("Daily"), CrawlFrequency::Daily);
        assert_eq!(
            CrawlFrequency::from_tag("weekly"),
            CrawlFrequency::Unrecognized("weekly".into())
        );
    }
}
