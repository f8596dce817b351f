//! Wire formats and the transport seam between fetch loops and the network.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zfcg_storage::{HttpFetcher, OutboundRequest, RequestBody};

use crate::site::SiteProfile;
use crate::AdapterError;

const SEARCH_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Body of the JSON full-text search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub token: String,
    /// Result-window offset, `page * rn`.
    pub pn: u32,
    pub rn: u32,
    pub sdt: String,
    pub edt: String,
    pub wd: String,
    pub inc_wd: String,
    pub exc_wd: String,
    pub fields: String,
    pub cnum: String,
    pub sort: String,
    pub ssort: String,
    pub cl: u32,
    pub terminal: String,
    pub condition: JsonValue,
    pub time: JsonValue,
    pub highlights: String,
    pub statistics: JsonValue,
    #[serde(rename = "unionCondition")]
    pub union_condition: JsonValue,
    pub accuracy: String,
    #[serde(rename = "noParticiple")]
    pub no_participle: String,
    #[serde(rename = "searchRange")]
    pub search_range: JsonValue,
}

impl SearchRequest {
    pub fn new(
        phrase: &str,
        page: u32,
        page_size: u32,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Self {
        Self {
            token: String::new(),
            pn: page * page_size,
            rn: page_size,
            sdt: start.format(SEARCH_TIME_FORMAT).to_string(),
            edt: end.format(SEARCH_TIME_FORMAT).to_string(),
            wd: phrase.to_string(),
            inc_wd: String::new(),
            exc_wd: String::new(),
            fields: "title;content".to_string(),
            cnum: "002".to_string(),
            sort: r#"{"webdate":"0"}"#.to_string(),
            ssort: "title".to_string(),
            cl: 500,
            terminal: String::new(),
            condition: JsonValue::Null,
            time: JsonValue::Null,
            highlights: "title;content".to_string(),
            statistics: JsonValue::Null,
            union_condition: JsonValue::Null,
            accuracy: String::new(),
            no_participle: "0".to_string(),
            search_range: JsonValue::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SearchResponse {
    pub result: SearchResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SearchResult {
    #[serde(deserialize_with = "lenient_u64")]
    pub totalcount: u64,
    pub records: Vec<SearchRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SearchRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(deserialize_with = "lenient_string")]
    pub content: String,
    #[serde(deserialize_with = "lenient_string")]
    pub webdate: String,
    #[serde(deserialize_with = "lenient_string")]
    pub linkurl: String,
}

/// Response of the form-encoded listing API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FormApiResponse {
    #[serde(deserialize_with = "lenient_u64")]
    pub total: u64,
    pub data: Vec<FormApiRecord>,
    pub code: i64,
    #[serde(deserialize_with = "lenient_string")]
    pub msg: String,
}

impl FormApiResponse {
    pub fn is_success(&self) -> bool {
        self.code == 0 || self.code == 200
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FormApiRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub purchase_project_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub purchaser: String,
    #[serde(deserialize_with = "lenient_string")]
    pub publish_date: String,
    #[serde(deserialize_with = "lenient_string")]
    pub url: String,
    #[serde(deserialize_with = "lenient_string")]
    pub purchase_agent: String,
}

fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(match JsonValue::deserialize(de)? {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s,
        other => other.to_string(),
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    Ok(match JsonValue::deserialize(de)? {
        JsonValue::Number(n) => n.as_u64().unwrap_or_default(),
        JsonValue::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0,
    })
}

/// Rejects HTML bodies before JSON decoding.
pub fn decode_json<T: for<'de> Deserialize<'de>>(
    body: &str,
    what: &str,
) -> Result<T, AdapterError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let head: String = trimmed.chars().take(100).collect();
        return Err(AdapterError::Decode(format!("{what} returned HTML instead of JSON: {head}")));
    }
    serde_json::from_str(trimmed)
        .map_err(|e| AdapterError::Decode(format!("{what} returned malformed JSON: {e}")))
}

/// Network operations the fetch loops need.
#[async_trait]
pub trait SiteTransport: Send + Sync {
    /// GETs a listing or detail page.
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError>;

    /// Runs one search page, trying each configured endpoint in order.
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, AdapterError>;

    /// Fetches one page of the form-encoded listing API.
    async fn query_form_api(
        &self,
        page_index: u32,
        page_size: u32,
    ) -> Result<FormApiResponse, AdapterError>;
}

/// [`SiteTransport`] over [`HttpFetcher`].
#[derive(Debug)]
pub struct HttpSiteTransport {
    fetcher: Arc<HttpFetcher>,
    profile: SiteProfile,
    form_endpoint: Mutex<Option<String>>,
}

impl HttpSiteTransport {
    pub fn new(fetcher: Arc<HttpFetcher>, profile: SiteProfile) -> Self {
        Self {
            fetcher,
            profile,
            form_endpoint: Mutex::new(None),
        }
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }

    async fn post(&self, request: OutboundRequest) -> Result<String, AdapterError> {
        Ok(self.fetcher.send(&request).await?.text())
    }

    fn form_request(&self, url: &str, page_index: u32, page_size: u32) -> OutboundRequest {
        OutboundRequest::post(
            url,
            RequestBody::Form(vec![
                ("pageIndex".to_string(), page_index.to_string()),
                ("pageSize".to_string(), page_size.to_string()),
                ("xxlx".to_string(), String::new()),
            ]),
        )
        .with_headers(self.profile.form_headers())
    }

    /// First form endpoint that answers a one-row probe with JSON. Cached
    /// for the lifetime of the transport.
    async fn resolve_form_endpoint(&self) -> Result<String, AdapterError> {
        let mut cached = self.form_endpoint.lock().await;
        if let Some(url) = cached.as_ref() {
            return Ok(url.clone());
        }
        for url in self.profile.form_urls() {
            match self.post(self.form_request(&url, 1, 1)).await {
                Ok(body) if !body.trim_start().starts_with('<') => {
                    debug!(%url, "form endpoint selected");
                    *cached = Some(url.clone());
                    return Ok(url);
                }
                Ok(_) => debug!(%url, "form endpoint answered with HTML"),
                Err(err) => debug!(%url, error = %err, "form endpoint probe failed"),
            }
        }
        Err(AdapterError::Decode(
            "no form endpoint answered with JSON".to_string(),
        ))
    }
}

#[async_trait]
impl SiteTransport for HttpSiteTransport {
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
        let request = OutboundRequest::get(url).with_headers(self.profile.page_headers());
        Ok(self.fetcher.send(&request).await?.text())
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, AdapterError> {
        let body = serde_json::to_string(request)
            .map_err(|e| AdapterError::Message(format!("encoding search request: {e}")))?;
        let mut last_error = AdapterError::Message("no search endpoints configured".to_string());
        for url in self.profile.search_urls() {
            let outbound = OutboundRequest::post(&url, RequestBody::Json(body.clone()))
                .with_headers(self.profile.search_headers());
            let result = match self.post(outbound).await {
                Ok(text) => decode_json::<SearchResponse>(&text, &url),
                Err(err) => Err(err),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(%url, error = %err, "search endpoint failed, trying next");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn query_form_api(
        &self,
        page_index: u32,
        page_size: u32,
    ) -> Result<FormApiResponse, AdapterError> {
        let url = self.resolve_form_endpoint().await?;
        let text = self.post(self.form_request(&url, page_index, page_size)).await?;
        decode_json(&text, &url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zfcg_storage::HttpClientConfig;

    const PORTAL_PAGE: &str = "<!DOCTYPE html><html><body>门户首页</body></html>";

    fn stub_transport(server: &MockServer) -> HttpSiteTransport {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let profile = SiteProfile {
            origin: server.uri(),
            search_endpoints: vec!["/search/legacy".to_string(), "/search/current".to_string()],
            form_endpoints: vec!["/gsgg/legacy".to_string(), "/gsgg/current.do".to_string()],
            ..SiteProfile::default()
        };
        HttpSiteTransport::new(Arc::new(fetcher), profile)
    }

    async fn hits(server: &MockServer, route: &str) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == route)
            .count()
    }

    #[test]
    fn search_request_uses_offset_window_and_wire_names() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .expect("start");
        let end = NaiveDate::from_ymd_opt(2024, 3, 2)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .expect("end");
        let request = SearchRequest::new("生态环境局 水务局", 2, 50, start, end);
        let json = serde_json::to_value(&request).expect("json");

        assert_eq!(json["pn"], 100);
        assert_eq!(json["rn"], 50);
        assert_eq!(json["sdt"], "2024-03-01 09:00:00");
        assert_eq!(json["wd"], "生态环境局 水务局");
        assert_eq!(json["sort"], r#"{"webdate":"0"}"#);
        assert_eq!(json["noParticiple"], "0");
        assert!(json["unionCondition"].is_null());
    }

    #[test]
    fn html_bodies_are_decode_errors() {
        let err = decode_json::<SearchResponse>("  <!DOCTYPE html><html>", "search")
            .expect_err("html must not decode");
        assert!(err.is_decode());
    }

    #[test]
    fn responses_tolerate_numeric_and_missing_fields() {
        let response: FormApiResponse = decode_json(
            r#"{"total":"3","code":200,"data":[{"id":1024,"purchaseProjectName":"监测设备","purchaser":null}]}"#,
            "form",
        )
        .expect("decode");
        assert_eq!(response.total, 3);
        assert!(response.is_success());
        assert_eq!(response.data[0].id, "1024");
        assert_eq!(response.data[0].purchaser, "");

        let search: SearchResponse = decode_json(r#"{"result":{"totalcount":0}}"#, "search")
            .expect("decode");
        assert_eq!(search.result.totalcount, 0);
        assert!(search.result.records.is_empty());
    }

    #[tokio::test]
    async fn search_falls_through_html_endpoint_to_json_one() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search/legacy"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PORTAL_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/search/current"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"result":{"totalcount":1,"records":[{"title":"生态环境局监测设备采购","webdate":"2024-03-01 09:00:00","linkurl":"/gsgg/1.html"}]}}"#,
            ))
            .mount(&server)
            .await;

        let start = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("start");
        let end = NaiveDate::from_ymd_opt(2024, 3, 2)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("end");
        let transport = stub_transport(&server);
        let response = transport
            .search(&SearchRequest::new("生态环境局", 0, 20, start, end))
            .await
            .expect("search");

        assert_eq!(response.result.totalcount, 1);
        assert_eq!(response.result.records[0].title, "生态环境局监测设备采购");
        assert_eq!(response.result.records[0].linkurl, "/gsgg/1.html");
        assert_eq!(hits(&server, "/search/legacy").await, 1);
        assert_eq!(hits(&server, "/search/current").await, 1);
    }

    #[tokio::test]
    async fn form_endpoint_is_chosen_once_and_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gsgg/legacy"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PORTAL_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/gsgg/current.do"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"total":1,"code":200,"msg":"","data":[{"id":"a1","purchaseProjectName":"监测设备采购","purchaser":"深圳市生态环境局","publishDate":"2024-03-01"}]}"#,
            ))
            .mount(&server)
            .await;

        let transport = stub_transport(&server);
        let first = transport.query_form_api(1, 20).await.expect("first page");
        let second = transport.query_form_api(2, 20).await.expect("second page");

        assert_eq!(first.data[0].id, "a1");
        assert_eq!(first.data[0].purchaser, "深圳市生态环境局");
        assert_eq!(second.total, 1);
        assert_eq!(
            transport.form_endpoint.lock().await.as_deref(),
            Some(format!("{}/gsgg/current.do", server.uri()).as_str())
        );
        // one selection round, then only the winning endpoint is queried
        assert_eq!(hits(&server, "/gsgg/legacy").await, 1);
        assert_eq!(hits(&server, "/gsgg/current.do").await, 3);
    }

    #[tokio::test]
    async fn form_api_without_json_endpoint_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PORTAL_PAGE))
            .mount(&server)
            .await;

        let transport = stub_transport(&server);
        let err = transport.query_form_api(1, 20).await.expect_err("no json endpoint");

        assert!(err.is_decode());
        assert!(transport.form_endpoint.lock().await.is_none());
    }
}
