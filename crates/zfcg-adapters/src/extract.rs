//! Field extraction: listing entries, detail content, publisher, dates.
//!
//! Every field with more than one way to find it is resolved by a
//! [`FallbackChain`]: an ordered list of named strategies where the first
//! strategy returning a value wins and later ones are never run.

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use zfcg_core::{is_acceptable_publisher, DEFAULT_KEYWORD, UNKNOWN_PUBLISHER};

use crate::AdapterError;

type StrategyFn<I, T> = Box<dyn Fn(&I) -> Result<Option<T>, AdapterError> + Send + Sync>;

struct Strategy<I: ?Sized, T> {
    name: String,
    run: StrategyFn<I, T>,
}

/// Ordered, first-success list of extraction strategies for one field.
pub struct FallbackChain<I: ?Sized, T> {
    field: &'static str,
    strategies: Vec<Strategy<I, T>>,
}

/// Outcome of a chain: the value, the strategy that produced it, and every
/// strategy that ran (in order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<T> {
    pub value: Option<T>,
    pub strategy: Option<String>,
    pub attempted: Vec<String>,
}

impl Resolution<String> {
    /// Value or the unknown-publisher sentinel.
    pub fn or_unknown(&self) -> String {
        self.value
            .clone()
            .unwrap_or_else(|| UNKNOWN_PUBLISHER.to_string())
    }
}

impl<I: ?Sized, T> FallbackChain<I, T> {
    pub fn new(field: &'static str) -> Self {
        Self {
            field,
            strategies: Vec::new(),
        }
    }

    pub fn then(
        mut self,
        name: impl Into<String>,
        run: impl Fn(&I) -> Result<Option<T>, AdapterError> + Send + Sync + 'static,
    ) -> Self {
        self.strategies.push(Strategy {
            name: name.into(),
            run: Box::new(run),
        });
        self
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn resolve(&self, input: &I) -> Result<Resolution<T>, AdapterError> {
        let mut attempted = Vec::new();
        for strategy in &self.strategies {
            attempted.push(strategy.name.clone());
            if let Some(value) = (strategy.run)(input)? {
                return Ok(Resolution {
                    value: Some(value),
                    strategy: Some(strategy.name.clone()),
                    attempted,
                });
            }
        }
        Ok(Resolution {
            value: None,
            strategy: None,
            attempted,
        })
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .find_map(|n| text_or_none(n.text().collect::<String>())))
}

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static DATE_SHAPED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}[-/]\d{1,2}[-/]\d{1,2}").expect("date regex"));

/// Decodes the entities the portal emits, mapping non-breaking spaces to
/// plain spaces.
pub fn decode_entities(text: &str) -> String {
    let spaced = text.replace("&nbsp;", " ").replace("&#160;", " ");
    html_escape::decode_html_entities(&spaced).replace('\u{a0}', " ")
}

/// Strips tags, decodes entities and trims.
pub fn clean_markup(markup: &str) -> String {
    decode_entities(&TAG.replace_all(markup, "")).trim().to_string()
}

pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Accepted publish date formats, first match wins. `true` marks formats
/// carrying a time of day.
const DATE_FORMATS: [(&str, bool); 4] = [
    ("%Y-%m-%d %H:%M:%S", true),
    ("%Y-%m-%d", false),
    ("%Y/%m/%d %H:%M:%S", true),
    ("%Y/%m/%d", false),
];

/// Parses a displayed date in any of the portal's formats.
pub fn parse_publish_date(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    DATE_FORMATS.into_iter().find_map(|(fmt, with_time)| {
        if with_time {
            NaiveDateTime::parse_from_str(text, fmt).ok().map(|dt| dt.date())
        } else {
            NaiveDate::parse_from_str(text, fmt).ok()
        }
    })
}

/// `YYYY-MM-DD` when the input parses, otherwise the input unchanged.
pub fn normalize_date(raw: &str) -> String {
    parse_publish_date(raw)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// One row of a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub title: String,
    pub href: String,
    pub date: String,
}

fn news_items(document: &Html) -> Result<Option<Vec<ListingEntry>>, AdapterError> {
    let items = selector("ul.news-items li")?;
    let styled_anchor = selector("a.text-overflow")?;
    let any_anchor = selector("a")?;
    let date = selector("span.news-time")?;

    let mut entries = Vec::new();
    for item in document.select(&items) {
        let Some(anchor) = item
            .select(&styled_anchor)
            .next()
            .or_else(|| item.select(&any_anchor).next())
        else {
            continue;
        };
        let Some(href) = usable_href(anchor.value().attr("href")) else {
            continue;
        };
        entries.push(ListingEntry {
            title: element_text(anchor),
            href,
            date: item.select(&date).next().map(element_text).unwrap_or_default(),
        });
    }
    Ok(non_empty(entries))
}

fn list_items(document: &Html) -> Result<Option<Vec<ListingEntry>>, AdapterError> {
    let items = selector("li")?;
    let anchor = selector("a[href]")?;
    let span = selector("span")?;

    let mut entries = Vec::new();
    for item in document.select(&items) {
        let Some((link, href)) = item
            .select(&anchor)
            .find_map(|a| usable_href(a.value().attr("href")).map(|href| (a, href)))
        else {
            continue;
        };
        let Some(date) = item
            .select(&span)
            .map(element_text)
            .find(|t| DATE_SHAPED.is_match(t))
        else {
            continue;
        };
        entries.push(ListingEntry {
            title: element_text(link),
            href,
            date,
        });
    }
    Ok(non_empty(entries))
}

fn table_rows(document: &Html) -> Result<Option<Vec<ListingEntry>>, AdapterError> {
    let rows = selector("tr")?;
    let anchor = selector("td a[href]")?;
    let cell = selector("td")?;

    let mut entries = Vec::new();
    for row in document.select(&rows) {
        let Some((link, href)) = row
            .select(&anchor)
            .find_map(|a| usable_href(a.value().attr("href")).map(|href| (a, href)))
        else {
            continue;
        };
        entries.push(ListingEntry {
            title: element_text(link),
            href,
            date: row.select(&cell).last().map(element_text).unwrap_or_default(),
        });
    }
    Ok(non_empty(entries))
}

/// Trimmed link target, or `None` for links that lead nowhere
/// (`""`, `#...`, `javascript:`).
fn usable_href(href: Option<&str>) -> Option<String> {
    let href = href?.trim();
    let scripted = href
        .get(..11)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("javascript:"));
    if href.is_empty() || href.starts_with('#') || scripted {
        return None;
    }
    Some(href.to_string())
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

static LISTING_CHAIN: Lazy<FallbackChain<Html, Vec<ListingEntry>>> = Lazy::new(|| {
    FallbackChain::new("listing")
        .then("news_items", news_items)
        .then("list_items", list_items)
        .then("table_rows", table_rows)
});

/// Listing entries of one page. An empty vector means no strategy found any.
pub fn extract_listing(html: &str) -> Result<Resolution<Vec<ListingEntry>>, AdapterError> {
    let document = Html::parse_document(html);
    LISTING_CHAIN.resolve(&document)
}

/// Labels that mark the purchasing organization in a label/value row.
pub const PUBLISHER_LABELS: [&str; 4] = ["采购单位", "采购人", "招标人", "甲方"];

/// Raw markup templates, tried in order against the unparsed page.
pub const PUBLISHER_PATTERNS: [&str; 8] = [
    r"采购人[（(]甲方[）)]\s*[：:]\s*([^<&\n\r]+?)(?:地址|联系方式|采购代理|项目联系|</|$)",
    r"采购单位[：:]\s*([^<&\n\r]+?)(?:地址|联系方式|采购代理|项目联系|</)",
    r"采购人[信息]?[：:]\s*(?:名称[：:]?\s*)?([^<&\n\r]+?)(?:地址|联系方式|采购代理|项目联系|</)",
    r"采购人名称[：:]\s*([^<&\n\r]+?)(?:地址|联系方式|</)",
    r"<td[^>]*>\s*采购单位\s*</td>\s*<td[^>]*>\s*([^<]+?)\s*</td>",
    r"<td[^>]*>\s*(?:采购人|招标人)\s*</td>\s*<td[^>]*>\s*([^<]+?)\s*</td>",
    r"<td[^>]*>\s*(?:采购人|招标人)名称\s*</td>\s*<td[^>]*>\s*([^<]+?)\s*</td>",
    r"<td[^>]*>\s*采购人[（(]甲方[）)]\s*</td>\s*<td[^>]*>\s*([^<]+?)\s*</td>",
];

static PUBLISHER_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    PUBLISHER_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("publisher regex"))
        .collect()
});

/// Normalizes a captured publisher and returns it only if it is acceptable.
pub fn accept_publisher(candidate: &str) -> Option<String> {
    let cleaned = collapse_whitespace(&decode_entities(candidate));
    is_acceptable_publisher(&cleaned).then_some(cleaned)
}

/// A fetched detail page: raw markup plus its parsed tree.
pub struct DetailDocument {
    raw: String,
    document: Html,
}

impl DetailDocument {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let document = Html::parse_document(&raw);
        Self { raw, document }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn document(&self) -> &Html {
        &self.document
    }
}

fn publisher_from_table(detail: &DetailDocument) -> Result<Option<String>, AdapterError> {
    let rows = selector("table tr")?;
    let cell = selector("td")?;
    for row in detail.document.select(&rows) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell).collect();
        if cells.len() < 2 {
            continue;
        }
        let label = element_text(cells[0]);
        if !PUBLISHER_LABELS.iter().any(|l| label.contains(l)) {
            continue;
        }
        if let Some(value) = accept_publisher(&element_text(cells[cells.len() - 1])) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn publisher_from_inline_party(detail: &DetailDocument) -> Result<Option<String>, AdapterError> {
    let blocks = selector("p, div, span")?;
    for block in detail.document.select(&blocks) {
        let text = element_text(block);
        if !(text.contains("采购人（甲方）") || text.contains("采购人(甲方)")) {
            continue;
        }
        // The first markup template is the labeled inline form.
        let candidate = publisher_from_pattern(0, &text);
        if candidate.is_some() {
            return Ok(candidate);
        }
    }
    Ok(None)
}

fn publisher_from_pattern(index: usize, raw: &str) -> Option<String> {
    PUBLISHER_REGEXES
        .get(index)?
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| accept_publisher(m.as_str()))
}

/// CJK punctuation that bounds an organization name in running text.
const SENTENCE_BREAKS: [char; 13] = [
    '，', '。', '；', '：', '？', '！', '、', '（', '）', '《', '》', '【', '】',
];

/// Finds the organization name surrounding the default keyword in running
/// text: the contiguous run of non-punctuation characters around its first
/// occurrence in a sentence.
pub fn publisher_from_free_text(text: &str) -> Option<String> {
    let plain = clean_markup(text);
    let target: Vec<char> = DEFAULT_KEYWORD.chars().collect();
    for sentence in plain.split('。') {
        let chars: Vec<char> = sentence.chars().collect();
        let Some(at) = chars.windows(target.len()).position(|w| w == target.as_slice()) else {
            continue;
        };
        let start = chars[..at]
            .iter()
            .rposition(|c| SENTENCE_BREAKS.contains(c))
            .map_or(0, |p| p + 1);
        let end = chars[at + target.len()..]
            .iter()
            .position(|c| SENTENCE_BREAKS.contains(c))
            .map_or(chars.len(), |p| at + target.len() + p);
        let candidate: String = chars[start..end].iter().collect();
        if let Some(found) = accept_publisher(&candidate) {
            return Some(found);
        }
    }
    None
}

static PUBLISHER_CHAIN: Lazy<FallbackChain<DetailDocument, String>> = Lazy::new(|| {
    let mut chain = FallbackChain::new("publisher")
        .then("table_rows", publisher_from_table)
        .then("inline_party", publisher_from_inline_party);
    for index in 0..PUBLISHER_PATTERNS.len() {
        chain = chain.then(format!("markup_pattern_{}", index + 1), move |d: &DetailDocument| {
            Ok(publisher_from_pattern(index, &d.raw))
        });
    }
    chain.then("free_text", |d: &DetailDocument| Ok(publisher_from_free_text(&d.raw)))
});

pub fn publisher_chain() -> &'static FallbackChain<DetailDocument, String> {
    &PUBLISHER_CHAIN
}

pub fn resolve_publisher(detail: &DetailDocument) -> Result<Resolution<String>, AdapterError> {
    PUBLISHER_CHAIN.resolve(detail)
}

fn content_from_rows(detail: &DetailDocument) -> Result<Option<String>, AdapterError> {
    let rows = selector("table tr")?;
    let cell = selector("td")?;
    let mut parts = Vec::new();
    for row in detail.document.select(&rows) {
        let mut cells = row.select(&cell);
        let Some(first) = cells.next() else {
            continue;
        };
        let label = element_text(first);
        let value = cells.last().map(element_text).unwrap_or_else(|| label.clone());
        if !label.is_empty() && !value.is_empty() {
            parts.push(format!("{label}: {}", collapse_whitespace(&value)));
        }
    }
    Ok(non_empty(parts).map(|p| p.join("\n\n")))
}

fn content_from_blocks(detail: &DetailDocument) -> Result<Option<String>, AdapterError> {
    let blocks = selector(".content, .detail-content, #content")?;
    let parts: Vec<String> = detail
        .document
        .select(&blocks)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect();
    Ok(non_empty(parts).map(|p| p.join("\n\n")))
}

fn content_from_body(detail: &DetailDocument) -> Result<Option<String>, AdapterError> {
    select_first_text(&detail.document, "body")
}

static CONTENT_CHAIN: Lazy<FallbackChain<DetailDocument, String>> = Lazy::new(|| {
    FallbackChain::new("content")
        .then("label_rows", content_from_rows)
        .then("content_blocks", content_from_blocks)
        .then("body_text", content_from_body)
});

const TITLE_SELECTORS: [&str; 6] = [
    "h1",
    ".title",
    ".content-title",
    ".article-title",
    "#title",
    "title",
];

static TITLE_CHAIN: Lazy<FallbackChain<DetailDocument, String>> = Lazy::new(|| {
    TITLE_SELECTORS
        .into_iter()
        .fold(FallbackChain::new("title"), |chain, css| {
            chain.then(css, move |d: &DetailDocument| {
                Ok(select_first_text(&d.document, css)?.map(|t| collapse_whitespace(&t)))
            })
        })
});

/// Fields recovered from one detail page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailFields {
    pub title: Option<String>,
    pub content: Option<String>,
    pub publisher: Resolution<String>,
}

pub fn extract_detail(html: &str) -> Result<DetailFields, AdapterError> {
    let detail = DetailDocument::parse(html);
    Ok(DetailFields {
        title: TITLE_CHAIN.resolve(&detail)?.value,
        content: CONTENT_CHAIN.resolve(&detail)?.value,
        publisher: resolve_publisher(&detail)?,
    })
}
