//! Site constants and request shaping for the procurement portal.

use serde::{Deserialize, Serialize};

pub const DEFAULT_ORIGIN: &str = "http://zfcg.szggzy.com:8081";

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const HTML_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,image/apng,*/*;q=0.8";
const JSON_ACCEPT: &str = "application/json, text/plain, */*";
const ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8";

/// Where the portal lives and how its pages and endpoints are addressed.
///
/// Paths are relative to `origin`. The defaults describe the Shenzhen
/// procurement portal; the adapter registry may override any of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub origin: String,
    /// Section that relative detail links hang off.
    pub section_path: String,
    /// Directory holding `list.html` and the numbered listing pages.
    pub listing_path: String,
    /// Category number used by the query-string form of deep listing pages.
    pub category: String,
    pub search_endpoints: Vec<String>,
    pub form_endpoints: Vec<String>,
    /// Page the form API expects as its referer.
    pub form_referer_path: String,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            section_path: "/gsgg/".to_string(),
            listing_path: "/gsgg/002001/002001002/".to_string(),
            category: "002001002".to_string(),
            search_endpoints: vec![
                "/inteligentsearch/rest/esinteligentsearch/getFullTextDataNew".to_string(),
            ],
            form_endpoints: vec![
                "/gsgg/querySecondPageGsgg".to_string(),
                "/gsgg/querySecondPageGsgg.do".to_string(),
                "/gsgg/querySecondPageGsgg.json".to_string(),
            ],
            form_referer_path: "/gsgg/secondPage.html".to_string(),
        }
    }
}

impl SiteProfile {
    fn origin(&self) -> &str {
        self.origin.trim_end_matches('/')
    }

    fn absolute(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.origin(), path.trim_start_matches('/'))
    }

    /// Turns a link found in a listing, search record or API row into an
    /// absolute URL. Scheme-relative links (`//host/path`) take the scheme
    /// of the origin; joining them onto the origin would double the host.
    pub fn complete_url(&self, link: &str) -> String {
        let link = link.trim();
        if link.starts_with("http://") || link.starts_with("https://") {
            link.to_string()
        } else if let Some(rest) = link.strip_prefix("//") {
            let scheme = self.origin().split_once("://").map_or("http", |(s, _)| s);
            format!("{scheme}://{rest}")
        } else if link.starts_with('/') {
            format!("{}{link}", self.origin())
        } else {
            let section = self.section_path.trim_matches('/');
            if section.is_empty() {
                format!("{}/{link}", self.origin())
            } else {
                format!("{}/{section}/{link}", self.origin())
            }
        }
    }

    /// URL of listing page `page` (1-based). Pages 2 to 10 are static files;
    /// deeper pages are only reachable through the query-string form.
    pub fn listing_page_url(&self, page: u32) -> String {
        let dir = format!("{}/", self.listing_path.trim_matches('/'));
        match page {
            0 | 1 => self.absolute(&format!("{dir}list.html")),
            2..=10 => self.absolute(&format!("{dir}{page}.html")),
            _ => self.absolute(&format!(
                "{dir}list.html?categoryNum={}&pageIndex={page}",
                self.category
            )),
        }
    }

    /// Re-targets the listing at the page a web page row points to, e.g.
    /// `http://host/gsgg/002001/002001004/list.html`. Other URL shapes leave
    /// the profile unchanged.
    pub fn for_listing_url(&self, page_url: &str) -> SiteProfile {
        let mut profile = self.clone();
        let without_query = page_url.split(['?', '#']).next().unwrap_or(page_url);
        let Some(dir) = without_query.strip_suffix("list.html") else {
            return profile;
        };
        let path = match dir.find("://") {
            Some(scheme_end) => {
                let after = &dir[scheme_end + 3..];
                match after.find('/') {
                    Some(slash) => {
                        profile.origin = dir[..scheme_end + 3 + slash].to_string();
                        after[slash..].to_string()
                    }
                    None => return profile,
                }
            }
            None => dir.to_string(),
        };
        if let Some(category) = path.trim_end_matches('/').rsplit('/').next() {
            if !category.is_empty() && category.chars().all(|c| c.is_ascii_digit()) {
                profile.category = category.to_string();
            }
        }
        profile.listing_path = path;
        profile
    }

    pub fn search_urls(&self) -> Vec<String> {
        self.search_endpoints.iter().map(|p| self.absolute(p)).collect()
    }

    pub fn form_urls(&self) -> Vec<String> {
        self.form_endpoints.iter().map(|p| self.absolute(p)).collect()
    }

    /// Headers for listing and detail page GETs.
    pub fn page_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Accept", HTML_ACCEPT.to_string()),
            ("Accept-Language", ACCEPT_LANGUAGE.to_string()),
            ("Referer", format!("{}/", self.origin())),
        ]
    }

    pub fn search_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Accept", JSON_ACCEPT.to_string()),
            ("Accept-Language", ACCEPT_LANGUAGE.to_string()),
            ("Origin", self.origin().to_string()),
            ("Referer", format!("{}/", self.origin())),
        ]
    }

    pub fn form_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Accept", JSON_ACCEPT.to_string()),
            ("Origin", self.origin().to_string()),
            ("Referer", self.absolute(&self.form_referer_path)),
        ]
    }

    /// Detail URL for an API row that only carries an id.
    pub fn detail_url_for_id(&self, id: &str) -> String {
        let section = self.section_path.trim_matches('/');
        self.absolute(&format!("{section}/detail/{id}.html"))
    }
}
