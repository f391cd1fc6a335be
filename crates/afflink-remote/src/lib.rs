//! Remote service contracts: the affiliate-link conversion endpoint and the
//! REST data API in front of the product table.

use std::time::Duration;

use afflink_core::{ensure_scheme, tag_affiliate_url, Agent, TableRow};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CONVERSION_TIMEOUT: Duration = Duration::from_secs(5);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const UPSERT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MERGE_DUPLICATES: &str = "resolution=merge-duplicates";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("API request failed: {status}")]
    Status { status: u16 },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("empty response body")]
    EmptyBody,
}

/// What the conversion endpoint answered with.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionPayload {
    /// JSON object keyed by agent identifier.
    AgentMap(Map<String, JsonValue>),
    /// Anything else, taken as a bare host/path for the default agent.
    BareUrl(String),
}

impl ConversionPayload {
    /// Interpret a 200 response body. Bodies that are not a JSON object fall
    /// back to the bare-URL heuristic.
    pub fn parse(body: &str) -> Result<Self, ConvertError> {
        match serde_json::from_str::<JsonValue>(body) {
            Ok(JsonValue::Object(map)) => Ok(Self::AgentMap(map)),
            Ok(JsonValue::String(text)) => Self::bare(&text),
            _ => Self::bare(body),
        }
    }

    fn bare(text: &str) -> Result<Self, ConvertError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ConvertError::EmptyBody);
        }
        Ok(Self::BareUrl(text.to_string()))
    }

    /// Tagged affiliate links to merge into the record, in agent order.
    pub fn affiliate_links(&self, referral_tag: &str) -> Vec<(Agent, String)> {
        match self {
            Self::AgentMap(map) => Agent::ALL
                .into_iter()
                .filter_map(|agent| {
                    map.get(agent.as_str())
                        .and_then(JsonValue::as_str)
                        .map(|url| (agent, tag_affiliate_url(url, referral_tag)))
                })
                .collect(),
            Self::BareUrl(text) => {
                let url = ensure_scheme(text).unwrap_or_else(|| text.clone());
                vec![(Agent::default(), tag_affiliate_url(&url, referral_tag))]
            }
        }
    }
}

#[async_trait]
pub trait LinkConverter: Send + Sync {
    async fn convert(&self, link: &str) -> Result<ConversionPayload, ConvertError>;
}

#[derive(Debug, Clone)]
pub struct HttpLinkConverter {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpLinkConverter {
    pub fn new(client: reqwest::Client, endpoint: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("parsing conversion endpoint {endpoint}"))?;
        Ok(Self {
            client,
            endpoint,
            timeout: CONVERSION_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, link: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.endpoint.clone())
            .query(&[("link", link)])
            .timeout(self.timeout)
    }
}

#[async_trait]
impl LinkConverter for HttpLinkConverter {
    async fn convert(&self, link: &str) -> Result<ConversionPayload, ConvertError> {
        let span = info_span!("convert_link", link);
        async {
            let resp = self.request(link).send().await?;
            let status = resp.status();
            if status != StatusCode::OK {
                return Err(ConvertError::Status {
                    status: status.as_u16(),
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "conversion response");
            ConversionPayload::parse(&body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("{status} - {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Result of reading a sample of the remote table. The body is kept raw and
/// only decoded when a caller asks for the sample rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableProbe {
    pub status: u16,
    pub content_range: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl TableProbe {
    pub fn sample(&self) -> Result<Vec<Map<String, JsonValue>>, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[async_trait]
pub trait TableGateway: Send + Sync {
    async fn probe(&self, limit: usize) -> Result<TableProbe, TableError>;
    async fn upsert(&self, rows: &[TableRow]) -> Result<u16, TableError>;
}

#[derive(Debug, Clone)]
pub struct RestTableConfig {
    pub base_url: String,
    pub table: String,
    pub api_key: String,
    pub probe_timeout: Duration,
    pub upsert_timeout: Duration,
}

/// PostgREST-style table endpoint (`<base>/rest/v1/<table>`).
#[derive(Debug, Clone)]
pub struct RestTable {
    client: reqwest::Client,
    endpoint: Url,
    auth: HeaderMap,
    probe_timeout: Duration,
    upsert_timeout: Duration,
}

impl RestTable {
    pub fn new(client: reqwest::Client, config: &RestTableConfig) -> anyhow::Result<Self> {
        let raw = format!(
            "{}/rest/v1/{}",
            config.base_url.trim_end_matches('/'),
            config.table
        );
        let endpoint = Url::parse(&raw).with_context(|| format!("parsing table endpoint {raw}"))?;

        let mut auth = HeaderMap::new();
        auth.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key).context("api key is not a valid header value")?,
        );
        auth.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .context("api key is not a valid header value")?,
        );

        Ok(Self {
            client,
            endpoint,
            auth,
            probe_timeout: config.probe_timeout,
            upsert_timeout: config.upsert_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn probe_request(&self, limit: usize) -> reqwest::RequestBuilder {
        self.client
            .get(self.endpoint.clone())
            .headers(self.auth.clone())
            .query(&[("select", "*".to_string()), ("limit", limit.to_string())])
            .timeout(self.probe_timeout)
    }

    fn upsert_request(&self, rows: &[TableRow]) -> reqwest::RequestBuilder {
        self.client
            .post(self.endpoint.clone())
            .headers(self.auth.clone())
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", MERGE_DUPLICATES)
            .json(rows)
            .timeout(self.upsert_timeout)
    }
}

#[async_trait]
impl TableGateway for RestTable {
    async fn probe(&self, limit: usize) -> Result<TableProbe, TableError> {
        let span = info_span!("table_probe", endpoint = %self.endpoint, limit);
        async {
            let resp = self.probe_request(limit).send().await?;
            let status = resp.status();
            let headers: Vec<(String, String)> = resp
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = resp.text().await?;
            if status != StatusCode::OK {
                return Err(TableError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            let content_range = headers
                .iter()
                .find(|(name, _)| name == "content-range")
                .map(|(_, value)| value.clone());
            Ok(TableProbe {
                status: status.as_u16(),
                content_range,
                headers,
                body,
            })
        }
        .instrument(span)
        .await
    }

    async fn upsert(&self, rows: &[TableRow]) -> Result<u16, TableError> {
        let span = info_span!("table_upsert", endpoint = %self.endpoint, rows = rows.len());
        async {
            let resp = self.upsert_request(rows).send().await?;
            let status = resp.status();
            if matches!(status.as_u16(), 200 | 201 | 204) {
                return Ok(status.as_u16());
            }
            let body = resp.text().await.unwrap_or_default();
            Err(TableError::Status {
                status: status.as_u16(),
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afflink_core::ItemRecord;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    type Seen = Arc<Mutex<Vec<String>>>;

    fn http_response(status_line: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\n{extra_headers}content-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_ascii_lowercase()
    }

    /// Local server answering every connection with `response`; `stall`
    /// holds the connection open without answering instead.
    async fn serve(response: String, stall: bool) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let seen: Seen = Arc::default();
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let request = read_request(&mut socket).await;
                log.lock().expect("lock").push(request);
                if stall {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    continue;
                }
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), seen)
    }

    fn converter_at(base: &str) -> HttpLinkConverter {
        HttpLinkConverter::new(reqwest::Client::new(), &format!("{base}/convert"))
            .expect("converter")
    }

    fn table_at(base: &str) -> RestTable {
        RestTable::new(
            reqwest::Client::new(),
            &RestTableConfig {
                base_url: base.to_string(),
                table: "db".into(),
                api_key: "anon-key".into(),
                probe_timeout: PROBE_TIMEOUT,
                upsert_timeout: UPSERT_TIMEOUT,
            },
        )
        .expect("table")
    }

    fn rest_table() -> RestTable {
        RestTable::new(
            reqwest::Client::new(),
            &RestTableConfig {
                base_url: "https://example.supabase.co/".into(),
                table: "db".into(),
                api_key: "anon-key".into(),
                probe_timeout: PROBE_TIMEOUT,
                upsert_timeout: UPSERT_TIMEOUT,
            },
        )
        .expect("table")
    }

    #[test]
    fn only_known_agents_are_taken_from_the_response() {
        let body = r#"{
            "kakobuy": "https://www.kakobuy.com/item/details?url=x",
            "cnfans": "https://cnfans.com/product?id=1",
            "oopbuy": "https://oopbuy.com/goods/1",
            "pandabuy": "https://pandabuy.com/x",
            "superbuy": 42
        }"#;
        let payload = ConversionPayload::parse(body).expect("payload");
        let links = payload.affiliate_links("dexikos");

        assert_eq!(
            links,
            vec![
                (
                    Agent::Kakobuy,
                    "https://www.kakobuy.com/item/details?url=x/dexikos".to_string()
                ),
                (Agent::Cnfans, "https://cnfans.com/product?id=1/dexikos".to_string()),
                (Agent::Oopbuy, "https://oopbuy.com/goods/1/dexikos".to_string()),
            ]
        );
    }

    #[test]
    fn non_json_body_is_a_bare_url_for_the_default_agent() {
        let payload = ConversionPayload::parse("  ikako.vip/r/abc \n").expect("payload");
        assert_eq!(payload, ConversionPayload::BareUrl("ikako.vip/r/abc".into()));
        assert_eq!(
            payload.affiliate_links("dexikos"),
            vec![(Agent::Kakobuy, "https://ikako.vip/r/abc/dexikos".to_string())]
        );
    }

    #[test]
    fn json_string_body_and_schemed_bare_urls() {
        let payload = ConversionPayload::parse("\"https://ikako.vip/r/abc\"").expect("payload");
        assert_eq!(
            payload.affiliate_links("t"),
            vec![(Agent::Kakobuy, "https://ikako.vip/r/abc/t".to_string())]
        );
    }

    #[test]
    fn empty_body_is_an_error() {
        assert!(matches!(
            ConversionPayload::parse("   "),
            Err(ConvertError::EmptyBody)
        ));
        assert!(matches!(
            ConversionPayload::parse("\"\""),
            Err(ConvertError::EmptyBody)
        ));
    }

    #[test]
    fn conversion_request_encodes_the_link() {
        let converter = HttpLinkConverter::new(
            reqwest::Client::new(),
            "https://affiliate.example.net/convert",
        )
        .expect("converter");
        let request = converter
            .request("https://weidian.com/item.html?itemID=1&a=b")
            .build()
            .expect("request");

        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.timeout(), Some(&CONVERSION_TIMEOUT));
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![(
                "link".to_string(),
                "https://weidian.com/item.html?itemID=1&a=b".to_string()
            )]
        );
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            rest_table().endpoint().as_str(),
            "https://example.supabase.co/rest/v1/db"
        );
    }

    #[test]
    fn upsert_request_asks_for_merge_duplicates() {
        let record: ItemRecord =
            serde_json::from_str(r#"{"id": 1, "link": "https://a.com"}"#).expect("item");
        let rows = vec![TableRow::from(&record)];
        let request = rest_table().upsert_request(&rows).build().expect("request");
        let headers = request.headers();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(headers["apikey"], "anon-key");
        assert_eq!(headers[AUTHORIZATION], "Bearer anon-key");
        assert_eq!(headers["prefer"], MERGE_DUPLICATES);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.timeout(), Some(&UPSERT_TIMEOUT));

        let body: JsonValue = serde_json::from_slice(
            request.body().and_then(|b| b.as_bytes()).expect("body"),
        )
        .expect("json");
        assert_eq!(body[0]["_id"], "1");
    }

    #[test]
    fn probe_request_selects_a_limited_sample() {
        let request = rest_table().probe_request(1).build().expect("request");
        assert_eq!(request.url().query(), Some("select=*&limit=1"));
        assert_eq!(request.timeout(), Some(&PROBE_TIMEOUT));
    }

    #[tokio::test]
    async fn converter_accepts_only_200() {
        let (base, seen) = serve(http_response("202 Accepted", "", ""), false).await;
        let err = converter_at(&base)
            .convert("weidian.com/item.html?itemID=1")
            .await
            .expect_err("202 is a failure");

        assert!(matches!(err, ConvertError::Status { status: 202 }));
        assert_eq!(err.to_string(), "API request failed: 202");
        let seen = seen.lock().expect("lock");
        assert!(seen[0].starts_with("get /convert?link=weidian.com%2fitem.html%3fitemid%3d1 "));
    }

    #[tokio::test]
    async fn converter_reads_plain_200_bodies_as_bare_urls() {
        let (base, _) = serve(
            http_response("200 OK", "content-type: text/plain\r\n", "ikako.vip/r/abc\n"),
            false,
        )
        .await;
        let payload = converter_at(&base).convert("a.com").await.expect("payload");
        assert_eq!(payload, ConversionPayload::BareUrl("ikako.vip/r/abc".into()));
    }

    #[tokio::test]
    async fn converter_reads_agent_maps() {
        let body = r#"{"kakobuy":"https://k/1","cnfans":"https://c/1"}"#;
        let (base, _) = serve(
            http_response("200 OK", "content-type: application/json\r\n", body),
            false,
        )
        .await;
        let payload = converter_at(&base).convert("a.com").await.expect("payload");
        assert_eq!(
            payload.affiliate_links("t"),
            vec![
                (Agent::Kakobuy, "https://k/1/t".to_string()),
                (Agent::Cnfans, "https://c/1/t".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn stalled_conversion_times_out() {
        let (base, _) = serve(String::new(), true).await;
        let err = converter_at(&base)
            .with_timeout(Duration::from_millis(100))
            .convert("a.com")
            .await
            .expect_err("timeout");

        match err {
            ConvertError::Request(inner) => assert!(inner.is_timeout()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn upsert_treats_204_as_success() {
        let (base, seen) = serve(http_response("204 No Content", "", ""), false).await;
        let record: ItemRecord =
            serde_json::from_str(r#"{"id": 5, "link": "https://a.com"}"#).expect("item");
        let status = table_at(&base)
            .upsert(&[TableRow::from(&record)])
            .await
            .expect("upsert");

        assert_eq!(status, 204);
        let seen = seen.lock().expect("lock");
        assert!(seen[0].starts_with("post /rest/v1/db "));
        assert!(seen[0].contains("prefer: resolution=merge-duplicates"));
        assert!(seen[0].contains("authorization: bearer anon-key"));
        assert!(seen[0].contains(r#""_id":"5""#));
    }

    #[tokio::test]
    async fn rejected_upsert_carries_the_response_body() {
        let body = r#"{"code":"23505","message":"duplicate key"}"#;
        let (base, _) = serve(http_response("409 Conflict", "", body), false).await;
        let err = table_at(&base).upsert(&[]).await.expect_err("conflict");

        match &err {
            TableError::Status { status, body: text } => {
                assert_eq!(*status, 409);
                assert_eq!(text, body);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.to_string(), format!("409 - {body}"));
    }

    #[tokio::test]
    async fn table_sample_keeps_headers_and_decodes_on_demand() {
        let (base, seen) = serve(
            http_response(
                "200 OK",
                "content-range: 0-0/*\r\n",
                r#"[{"_id":"1","price":2.5}]"#,
            ),
            false,
        )
        .await;
        let probe = table_at(&base).probe(1).await.expect("probe");

        assert_eq!(probe.status, 200);
        assert_eq!(probe.content_range.as_deref(), Some("0-0/*"));
        let sample = probe.sample().expect("sample");
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0]["price"], 2.5);
        assert!(seen.lock().expect("lock")[0].starts_with("get /rest/v1/db?select=*&limit=1 "));
    }

    #[tokio::test]
    async fn table_check_succeeds_on_an_undecodable_200_body() {
        let (base, _) = serve(http_response("200 OK", "", "<html>ok</html>"), false).await;
        let probe = table_at(&base).probe(1).await.expect("probe");
        assert_eq!(probe.status, 200);
        assert!(probe.sample().is_err());
    }

    #[tokio::test]
    async fn failed_table_check_is_a_status_error() {
        let (base, _) = serve(http_response("401 Unauthorized", "", "bad key"), false).await;
        let err = table_at(&base).probe(1).await.expect_err("unauthorized");
        assert_eq!(err.to_string(), "401 - bad key");
    }
}
