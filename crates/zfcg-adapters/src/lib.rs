//! Site adapter, extraction chains, keyword matching and fetch loops for the
//! procurement portal.

use thiserror::Error;
use zfcg_storage::FetchError;

pub mod extract;
pub mod fetch_loop;
pub mod matcher;
pub mod site;
pub mod transport;

pub use extract::{
    clean_markup, extract_detail, extract_listing, normalize_date, publisher_from_free_text,
    resolve_publisher, DetailDocument, DetailFields, FallbackChain, ListingEntry, Resolution,
};
pub use fetch_loop::{
    crawl_form_api, crawl_listing, crawl_search, run_crawl, CrawlPlan, CrawlReport,
    FetchLoopConfig, SearchWindow, StopReason,
};
pub use matcher::KeywordMatcher;
pub use site::{SiteProfile, BROWSER_USER_AGENT, DEFAULT_ORIGIN};
pub use transport::{
    FormApiRecord, FormApiResponse, HttpSiteTransport, SearchRecord, SearchRequest,
    SearchResponse, SiteTransport,
};

pub const CRATE_NAME: &str = "zfcg-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network or HTTP status failure; the page may work on a later attempt.
    #[error("transport: {0}")]
    Transport(String),
    /// The endpoint answered, but not in the expected format.
    #[error("decode: {0}")]
    Decode(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        Self::Transport(err.to_string())
    }
}
