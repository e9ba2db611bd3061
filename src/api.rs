//! Remote sync endpoints.
//!
//! ```text
//! GET  {base}/sync/bundle                    → full bundle
//! GET  {base}/sync/bundle?buckets=menu,...   → only the listed buckets
//! POST {base}/sync/delta  {"hashes": {...}}  → changed buckets only
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client as HttpClient};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bundle::{verify_hash, Bucket, ReceivedBundle};
use crate::config::ServerConfig;
use crate::state::{SyncError, SyncResult};

/// Body of `GET /sync/bundle`. Bucket contents sit at the top level next to
/// `hashes` and `synced_at`; a filtered request only carries the requested
/// buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleResponse {
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub buckets: BTreeMap<String, Value>,
}

impl BundleResponse {
    /// Validate and decode into a bundle holding exactly the buckets the
    /// server sent. Every bucket needs a hash and every hash needs content.
    /// Buckets this client does not know about are skipped.
    pub fn validate(self, verify_hashes: bool) -> SyncResult<ReceivedBundle> {
        let BundleResponse {
            mut hashes,
            synced_at,
            buckets,
        } = self;

        let mut received = ReceivedBundle::new(synced_at.unwrap_or_else(Utc::now));

        for (name, value) in buckets {
            let bucket: Bucket = match name.parse() {
                Ok(b) => b,
                Err(_) => {
                    tracing::debug!("Ignoring unknown bucket {} in bundle response", name);
                    hashes.remove(&name);
                    continue;
                }
            };
            let hash = hashes.remove(&name).ok_or_else(|| {
                SyncError::InvalidData(format!("bucket {bucket} arrived without a hash"))
            })?;
            if verify_hashes {
                verify_hash(bucket, &value, &hash)?;
            }
            received.insert(bucket, value, hash)?;
        }

        let orphaned: Vec<&String> = hashes
            .keys()
            .filter(|name| name.parse::<Bucket>().is_ok())
            .collect();
        if let Some(name) = orphaned.first() {
            return Err(SyncError::InvalidData(format!(
                "hash for bucket {name} arrived without content"
            )));
        }

        Ok(received)
    }
}

/// Body of `POST /sync/delta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaRequest {
    pub hashes: BTreeMap<Bucket, String>,
}

/// One changed bucket in a delta response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketPayload {
    pub data: Value,
    pub hash: String,
}

/// Response of `POST /sync/delta`: only the buckets whose hash differs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaResponse {
    #[serde(default)]
    pub changed: BTreeMap<String, BucketPayload>,
    #[serde(default)]
    pub unchanged: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl DeltaResponse {
    pub fn is_unchanged(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Transport used by the sync service.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Fetch the bundle, optionally restricted to `buckets`.
    async fn fetch_bundle(&self, buckets: Option<&[Bucket]>) -> SyncResult<BundleResponse>;

    /// Send local hashes, receive the buckets that changed.
    async fn fetch_delta(&self, request: &DeltaRequest) -> SyncResult<DeltaResponse>;
}

/// [`SyncApi`] over HTTP.
pub struct HttpSyncApi {
    http_client: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl HttpSyncApi {
    pub fn new(config: &ServerConfig) -> SyncResult<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("edugo-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(http_client, config))
    }

    /// Use a preconfigured client. The config's timeout is not applied.
    pub fn with_client(http_client: HttpClient, config: &ServerConfig) -> Self {
        Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn fetch_bundle(&self, buckets: Option<&[Bucket]>) -> SyncResult<BundleResponse> {
        let mut request = self.http_client.get(self.url("/sync/bundle"));
        if let Some(buckets) = buckets {
            request = request.query(&[("buckets", bucket_filter(buckets))]);
        }

        tracing::debug!("GET /sync/bundle (buckets: {:?})", buckets);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        read_json(response).await
    }

    async fn fetch_delta(&self, request: &DeltaRequest) -> SyncResult<DeltaResponse> {
        tracing::debug!("POST /sync/delta ({} hashes)", request.hashes.len());
        let response = self
            .authorize(self.http_client.post(self.url("/sync/delta")).json(request))
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        read_json(response).await
    }
}

/// `menu,screens` form used by the `buckets` query parameter.
pub fn bucket_filter(buckets: &[Bucket]) -> String {
    buckets
        .iter()
        .map(Bucket::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> SyncResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        return Err(SyncError::Network(format!("HTTP {status}: {snippet}")));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| SyncError::Network(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| SyncError::Decoding(format!("response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::content_hash;
    use crate::bundle::tests::sample_menu;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn parse(value: Value) -> BundleResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_bundle_response_flattens_buckets() {
        let response = parse(json!({
            "menu": sample_menu(),
            "permissions": ["a"],
            "hashes": {"menu": "m1", "permissions": "p1"},
            "synced_at": "2026-03-01T10:00:00Z"
        }));
        assert_eq!(response.buckets.len(), 2);
        assert_eq!(response.hashes["menu"], "m1");

        let bundle = response.validate(false).unwrap().into_bundle();
        assert_eq!(bundle.present_buckets(), vec![Bucket::Menu, Bucket::Permissions]);
        assert_eq!(bundle.permissions, vec!["a"]);
        assert_eq!(bundle.synced_at.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_bucket_without_hash_is_rejected() {
        let response = parse(json!({"permissions": ["a"], "hashes": {}}));
        assert!(matches!(
            response.validate(false),
            Err(SyncError::InvalidData(msg)) if msg.contains("permissions")
        ));
    }

    #[test]
    fn test_hash_without_bucket_is_rejected() {
        let response = parse(json!({"permissions": ["a"], "hashes": {"permissions": "p", "strings": "s"}}));
        assert!(matches!(
            response.validate(false),
            Err(SyncError::InvalidData(msg)) if msg.contains("strings")
        ));
    }

    #[test]
    fn test_unknown_bucket_is_ignored() {
        let response = parse(json!({
            "features": {"beta": true},
            "glossary": {"unit": "Grade"},
            "hashes": {"features": "f", "glossary": "g"}
        }));
        let received = response.validate(false).unwrap();
        assert_eq!(received.bundle.present_buckets(), vec![Bucket::Glossary]);
        assert_eq!(received.raw(Bucket::Glossary), Some(&json!({"unit": "Grade"})));
    }

    #[test]
    fn test_wrong_bucket_shape_is_decoding_error() {
        let response = parse(json!({"menu": "nope", "hashes": {"menu": "m"}}));
        assert!(matches!(response.validate(false), Err(SyncError::Decoding(_))));
    }

    #[test]
    fn test_verification() {
        let menu = sample_menu();
        let good = parse(json!({"menu": menu.clone(), "hashes": {"menu": content_hash(&menu)}}));
        assert!(good.validate(true).is_ok());

        let bad = parse(json!({"menu": menu, "hashes": {"menu": "stale"}}));
        assert!(matches!(bad.validate(true), Err(SyncError::InvalidData(_))));
    }

    #[test]
    fn test_delta_request_shape() {
        let mut hashes = BTreeMap::new();
        hashes.insert(Bucket::Menu, "m1".to_string());
        hashes.insert(Bucket::AvailableContexts, "c1".to_string());
        let encoded = serde_json::to_value(DeltaRequest { hashes }).unwrap();
        assert_eq!(
            encoded,
            json!({"hashes": {"menu": "m1", "available_contexts": "c1"}})
        );
    }

    #[test]
    fn test_delta_response_parsing() {
        let response: DeltaResponse = serde_json::from_value(json!({
            "changed": {"strings": {"data": {"home": "Inicio"}, "hash": "s2"}},
            "unchanged": ["menu"],
            "synced_at": "2026-03-02T00:00:00Z"
        }))
        .unwrap();
        assert!(!response.is_unchanged());
        assert_eq!(response.changed["strings"].hash, "s2");
        assert_eq!(response.unchanged, vec!["menu"]);

        let empty: DeltaResponse = serde_json::from_value(json!({})).unwrap();
        assert!(empty.is_unchanged());
        assert!(empty.synced_at.is_none());
    }

    #[test]
    fn test_bucket_filter() {
        assert_eq!(
            bucket_filter(&[Bucket::Menu, Bucket::AvailableContexts]),
            "menu,available_contexts"
        );
    }

    #[test]
    fn test_http_api_normalizes_base_url() {
        let config = ServerConfig {
            base_url: "https://api.example.test/v1/".to_string(),
            token: Some(String::new()),
            timeout_secs: 5,
        };
        let api = HttpSyncApi::new(&config).unwrap();
        assert_eq!(api.url("/sync/delta"), "https://api.example.test/v1/sync/delta");
        assert!(api.token.is_none());
    }

    /// Answer a single HTTP request with `status` and `body`. The handle
    /// yields the raw request as received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&request) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}/api"), handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        raw.len() >= header_end + 4 + content_length
    }

    fn local_api(base_url: String, token: Option<&str>) -> HttpSyncApi {
        let config = ServerConfig {
            base_url,
            token: token.map(str::to_string),
            timeout_secs: 5,
        };
        let client = HttpClient::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        HttpSyncApi::with_client(client, &config)
    }

    #[tokio::test]
    async fn test_fetch_bundle_sends_filter_and_token() {
        let (base_url, server) =
            serve_once("200 OK", r#"{"menu": [], "hashes": {"menu": "m1"}}"#).await;
        let api = local_api(base_url, Some("secret-token"));

        let response = api
            .fetch_bundle(Some(&[Bucket::Menu, Bucket::Screens]))
            .await
            .unwrap();
        assert_eq!(response.hashes["menu"], "m1");

        let request = server.await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(
            request_line == "GET /api/sync/bundle?buckets=menu%2Cscreens HTTP/1.1"
                || request_line == "GET /api/sync/bundle?buckets=menu,screens HTTP/1.1",
            "unexpected request line: {request_line}"
        );
        assert!(request
            .to_ascii_lowercase()
            .contains("\r\nauthorization: bearer secret-token\r\n"));
    }

    #[tokio::test]
    async fn test_fetch_full_bundle_has_no_filter() {
        let (base_url, server) = serve_once("200 OK", r#"{"hashes": {}}"#).await;
        let api = local_api(base_url, None);

        api.fetch_bundle(None).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/sync/bundle HTTP/1.1\r\n"));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn test_fetch_delta_posts_hashes() {
        let (base_url, server) =
            serve_once("200 OK", r#"{"changed": {}, "unchanged": ["menu"]}"#).await;
        let api = local_api(base_url, Some("secret-token"));

        let mut hashes = BTreeMap::new();
        hashes.insert(Bucket::Menu, "m1".to_string());
        let response = api.fetch_delta(&DeltaRequest { hashes }).await.unwrap();
        assert!(response.is_unchanged());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/sync/delta HTTP/1.1\r\n"));
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("\r\ncontent-type: application/json\r\n"));
        assert!(lower.contains("\r\nauthorization: bearer secret-token\r\n"));
        assert!(request.ends_with(r#"{"hashes":{"menu":"m1"}}"#));
    }

    #[tokio::test]
    async fn test_error_status_is_network_error() {
        let (base_url, server) = serve_once("503 Service Unavailable", "maintenance").await;
        let api = local_api(base_url, None);

        let err = api.fetch_bundle(None).await.unwrap_err();
        assert!(
            matches!(&err, SyncError::Network(msg) if msg.contains("503") && msg.contains("maintenance")),
            "unexpected error: {err:?}"
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_body_is_decoding_error() {
        let (base_url, server) = serve_once("200 OK", "{not json").await;
        let api = local_api(base_url, None);

        let err = api.fetch_delta(&DeltaRequest::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Decoding(_)), "unexpected error: {err:?}");
        server.await.unwrap();
    }
}
