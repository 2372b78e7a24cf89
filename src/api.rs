use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::config::{AppConfig, MarketplaceConfig};
use crate::error::MonitorError;
use crate::retry::{RetryPolicy, with_retry};
use crate::types::{Marketplace, PollWindow, RaribleActivityType};

/// Source of marketplace activity labels for a wallet over a polling window.
#[async_trait]
pub trait ActivityFeed: Send + Sync {
    async fn fetch_events(
        &self,
        source: Marketplace,
        wallet_address: &str,
        window: PollWindow,
    ) -> Result<Vec<String>, MonitorError>;
}

/// OpenSea `GET /api/v1/events` response (only the fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct OpenSeaEventsResponse {
    pub asset_events: Vec<OpenSeaAssetEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenSeaAssetEvent {
    pub event_type: String,
}

/// Rarible `GET /v0.1/activities/byUser` response. Activities are only
/// counted, never inspected.
#[derive(Debug, Clone, Deserialize)]
pub struct RaribleActivitiesResponse {
    pub activities: Vec<serde_json::Value>,
}

/// One label per OpenSea record, its `event_type`, in response order.
pub fn opensea_labels(resp: &OpenSeaEventsResponse) -> Vec<String> {
    resp.asset_events
        .iter()
        .map(|e| e.event_type.clone())
        .collect()
}

/// One copy of the requested tag per returned activity, pages concatenated
/// in the order given.
pub fn rarible_labels(pages: &[(RaribleActivityType, RaribleActivitiesResponse)]) -> Vec<String> {
    pages
        .iter()
        .flat_map(|(kind, page)| {
            std::iter::repeat_n(kind.as_str().to_string(), page.activities.len())
        })
        .collect()
}

/// Format unix seconds the way Rarible expects: RFC 3339, UTC, milliseconds.
pub fn rarible_timestamp(secs: u64) -> String {
    DateTime::<Utc>::from_timestamp(secs as i64, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// HTTP client for the OpenSea and Rarible activity APIs.
#[derive(Clone)]
pub struct MarketplaceClient {
    http: reqwest::Client,
    opensea_url: String,
    rarible_url: String,
    opensea_api_key: String,
    retry: RetryPolicy,
}

impl MarketplaceClient {
    pub fn new(config: &AppConfig) -> Result<Self, MonitorError> {
        let http = reqwest::Client::builder()
            .timeout(config.settings.request_timeout())
            .build()
            .map_err(|e| MonitorError::fetch(Marketplace::OpenSea, format!("client init: {e}")))?;
        let retry = RetryPolicy::new(
            config.settings.max_retries,
            config.settings.retry_base_delay(),
        );
        Ok(Self::with_client(http, &config.marketplace, retry))
    }

    pub fn with_client(http: reqwest::Client, config: &MarketplaceConfig, retry: RetryPolicy) -> Self {
        Self {
            http,
            opensea_url: config.opensea_url.trim_end_matches('/').to_string(),
            rarible_url: config.rarible_url.trim_end_matches('/').to_string(),
            opensea_api_key: config.opensea_api_key.clone(),
            retry,
        }
    }

    pub fn opensea_events_url(&self, wallet_address: &str, window: PollWindow) -> Result<Url, MonitorError> {
        let mut url = Url::parse(&format!("{}/api/v1/events", self.opensea_url))
            .map_err(|e| MonitorError::fetch(Marketplace::OpenSea, format!("bad url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("account_address", wallet_address)
            .append_pair("only_opensea", "true")
            .append_pair("offset", "0")
            .append_pair("occurred_before", &window.to.to_string())
            .append_pair("occurred_after", &window.from.to_string());
        Ok(url)
    }

    pub fn rarible_activities_url(
        &self,
        kind: RaribleActivityType,
        wallet_address: &str,
        window: PollWindow,
    ) -> Result<Url, MonitorError> {
        let mut url = Url::parse(&format!("{}/v0.1/activities/byUser", self.rarible_url))
            .map_err(|e| MonitorError::fetch(Marketplace::Rarible, format!("bad url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("type", kind.as_str())
            .append_pair("user", &format!("ETHEREUM:{wallet_address}"))
            .append_pair("to", &rarible_timestamp(window.to))
            .append_pair("from", &rarible_timestamp(window.from));
        Ok(url)
    }

    /// Fetch OpenSea events for the wallet: a single request, one label per record.
    pub async fn fetch_opensea_events(
        &self,
        wallet_address: &str,
        window: PollWindow,
    ) -> Result<Vec<String>, MonitorError> {
        let url = self.opensea_events_url(wallet_address, window)?;
        let mut headers = HeaderMap::new();
        if !self.opensea_api_key.is_empty() {
            let key = HeaderValue::from_str(&self.opensea_api_key)
                .map_err(|e| MonitorError::fetch(Marketplace::OpenSea, format!("bad api key: {e}")))?;
            headers.insert("X-API-KEY", key);
        }
        let resp: OpenSeaEventsResponse = self.get_json(Marketplace::OpenSea, url, headers).await?;
        let labels = opensea_labels(&resp);
        debug!("Fetched {} OpenSea events", labels.len());
        Ok(labels)
    }

    /// Fetch Rarible activities: one request per activity type, labelled by
    /// the requested type.
    pub async fn fetch_rarible_events(
        &self,
        wallet_address: &str,
        window: PollWindow,
    ) -> Result<Vec<String>, MonitorError> {
        let mut pages = Vec::with_capacity(RaribleActivityType::ALL.len());
        for kind in RaribleActivityType::ALL {
            let url = self.rarible_activities_url(kind, wallet_address, window)?;
            let page: RaribleActivitiesResponse = self
                .get_json(Marketplace::Rarible, url, HeaderMap::new())
                .await?;
            pages.push((kind, page));
        }
        let labels = rarible_labels(&pages);
        debug!("Fetched {} Rarible activities", labels.len());
        Ok(labels)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        source: Marketplace,
        url: Url,
        headers: HeaderMap,
    ) -> Result<T, MonitorError> {
        with_retry(self.retry, &format!("{source} request"), || {
            let request = self
                .http
                .get(url.clone())
                .header(ACCEPT, "application/json")
                .headers(headers.clone());
            async move {
                let resp = request.send().await.map_err(|e| request_error(source, e))?;
                let status = resp.status();
                if !status.is_success() {
                    let reason = format!("HTTP {status}");
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        return Err(MonitorError::fetch_transient(source, reason));
                    }
                    return Err(MonitorError::fetch(source, reason));
                }
                let body = resp.text().await.map_err(|e| request_error(source, e))?;
                serde_json::from_str(&body)
                    .map_err(|e| MonitorError::fetch(source, format!("malformed body: {e}")))
            }
        })
        .await
    }
}

fn request_error(source: Marketplace, e: reqwest::Error) -> MonitorError {
    if e.is_timeout() {
        MonitorError::fetch_transient(source, format!("request timed out: {e}"))
    } else if e.is_connect() {
        MonitorError::fetch_transient(source, format!("connection error: {e}"))
    } else {
        MonitorError::fetch(source, e)
    }
}

#[async_trait]
impl ActivityFeed for MarketplaceClient {
    async fn fetch_events(
        &self,
        source: Marketplace,
        wallet_address: &str,
        window: PollWindow,
    ) -> Result<Vec<String>, MonitorError> {
        match source {
            Marketplace::OpenSea => self.fetch_opensea_events(wallet_address, window).await,
            Marketplace::Rarible => self.fetch_rarible_events(wallet_address, window).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    const WINDOW: PollWindow = PollWindow { from: 1000, to: 1005 };

    /// Minimal HTTP/1.1 server: answers every request with `route(path_and_query)`
    /// and records each request head.
    async fn spawn_server<F>(route: F) -> (String, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let heads = Arc::new(Mutex::new(Vec::new()));
        let seen = heads.clone();
        let route = Arc::new(route);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let route = route.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    seen.lock().unwrap().push(head);
                    let (status, body) = route(&target);
                    let resp = format!(
                        "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{addr}"), heads)
    }

    fn client_for(base: &str, api_key: &str) -> MarketplaceClient {
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let config = MarketplaceConfig {
            opensea_url: base.to_string(),
            rarible_url: base.to_string(),
            opensea_api_key: api_key.to_string(),
        };
        MarketplaceClient::with_client(http, &config, RetryPolicy::new(3, Duration::from_millis(1)))
    }

    fn query_param(target: &str, name: &str) -> Option<String> {
        let url = Url::parse(&format!("http://localhost{target}")).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn opensea_labels_keep_response_order() {
        let resp: OpenSeaEventsResponse = serde_json::from_value(json!({
            "asset_events": [
                {"event_type": "successful", "id": 1},
                {"event_type": "transfer"},
                {"event_type": "successful"}
            ]
        }))
        .unwrap();
        assert_eq!(opensea_labels(&resp), vec!["successful", "transfer", "successful"]);
    }

    #[test]
    fn rarible_labels_repeat_requested_tag() {
        let page = |n: usize| RaribleActivitiesResponse {
            activities: vec![json!({"@type": "whatever"}); n],
        };
        let pages = vec![
            (RaribleActivityType::TransferFrom, page(0)),
            (RaribleActivityType::Mint, page(2)),
            (RaribleActivityType::Sell, page(1)),
        ];
        assert_eq!(rarible_labels(&pages), vec!["MINT", "MINT", "SELL"]);
    }

    #[test]
    fn rarible_timestamp_matches_iso_millis() {
        assert_eq!(rarible_timestamp(1000), "1970-01-01T00:16:40.000Z");
        assert_eq!(rarible_timestamp(1_650_000_000), "2022-04-15T05:20:00.000Z");
    }

    #[test]
    fn opensea_url_binds_wallet_and_window() {
        let client = client_for("https://testnets-api.opensea.io/", "");
        let url = client.opensea_events_url("0xABC", WINDOW).unwrap();
        assert_eq!(url.path(), "/api/v1/events");
        let target = format!("{}?{}", url.path(), url.query().unwrap());
        assert_eq!(query_param(&target, "account_address").as_deref(), Some("0xABC"));
        assert_eq!(query_param(&target, "only_opensea").as_deref(), Some("true"));
        assert_eq!(query_param(&target, "offset").as_deref(), Some("0"));
        assert_eq!(query_param(&target, "occurred_before").as_deref(), Some("1005"));
        assert_eq!(query_param(&target, "occurred_after").as_deref(), Some("1000"));
    }

    #[test]
    fn rarible_url_binds_type_user_and_range() {
        let client = client_for("https://api-staging.rarible.org", "");
        let url = client
            .rarible_activities_url(RaribleActivityType::MakeBid, "0xABC", WINDOW)
            .unwrap();
        assert_eq!(url.path(), "/v0.1/activities/byUser");
        let target = format!("{}?{}", url.path(), url.query().unwrap());
        assert_eq!(query_param(&target, "type").as_deref(), Some("MAKE_BID"));
        assert_eq!(query_param(&target, "user").as_deref(), Some("ETHEREUM:0xABC"));
        assert_eq!(
            query_param(&target, "to").as_deref(),
            Some("1970-01-01T00:16:45.000Z")
        );
        assert_eq!(
            query_param(&target, "from").as_deref(),
            Some("1970-01-01T00:16:40.000Z")
        );
    }

    #[tokio::test]
    async fn opensea_fetch_sends_key_and_maps_records() {
        let (base, heads) = spawn_server(|_| {
            (
                200,
                json!({"asset_events": [{"event_type": "successful"}, {"event_type": "created"}]})
                    .to_string(),
            )
        })
        .await;
        let client = client_for(&base, "secret-key");
        let labels = client.fetch_opensea_events("0xABC", WINDOW).await.unwrap();
        assert_eq!(labels, vec!["successful", "created"]);

        let heads = heads.lock().unwrap();
        assert_eq!(heads.len(), 1);
        assert!(heads[0].to_lowercase().contains("x-api-key: secret-key"));
    }

    #[tokio::test]
    async fn rarible_fetch_queries_every_tag_in_order() {
        let (base, heads) = spawn_server(|target| {
            let count = match query_param(target, "type").as_deref() {
                Some("MINT") => 1,
                Some("BUY") => 2,
                _ => 0,
            };
            let activities = vec![json!({"id": "x"}); count];
            (200, json!({"activities": activities}).to_string())
        })
        .await;
        let client = client_for(&base, "");
        let labels = client.fetch_rarible_events("0xABC", WINDOW).await.unwrap();
        assert_eq!(labels, vec!["MINT", "BUY", "BUY"]);

        let heads = heads.lock().unwrap();
        let requested: Vec<String> = heads
            .iter()
            .filter_map(|h| h.split_whitespace().nth(1).map(str::to_string))
            .filter_map(|t| query_param(&t, "type"))
            .collect();
        let expected: Vec<String> = RaribleActivityType::ALL
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        assert_eq!(requested, expected);
        assert!(!heads.iter().any(|h| h.to_lowercase().contains("x-api-key")));
    }

    #[tokio::test]
    async fn non_success_status_is_fetch_failed() {
        let (base, _) = spawn_server(|_| (404, "{}".to_string())).await;
        let client = client_for(&base, "");
        let err = client
            .fetch_events(Marketplace::OpenSea, "0xABC", WINDOW)
            .await
            .unwrap_err();
        match err {
            MonitorError::FetchFailed {
                marketplace,
                reason,
                transient,
            } => {
                assert!(!transient);
                assert_eq!(marketplace, Marketplace::OpenSea);
                assert!(reason.contains("404"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_body_is_fetch_failed() {
        let (base, _) = spawn_server(|_| (200, "{\"unexpected\": true}".to_string())).await;
        let client = client_for(&base, "");
        let err = client
            .fetch_events(Marketplace::Rarible, "0xABC", WINDOW)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::FetchFailed {
                marketplace: Marketplace::Rarible,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_fetched_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let (base, _) = spawn_server(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            (200, format!("{}x", " ".repeat(499)))
        })
        .await;
        let client = client_for(&base, "");
        let err = client.fetch_opensea_events("0xABC", WINDOW).await.unwrap_err();
        assert!(err.to_string().contains("column 500"));
        assert!(!err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_error_status_is_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let (base, _) = spawn_server(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            (400, "{}".to_string())
        })
        .await;
        let client = client_for(&base, "");
        // A wallet containing a status-like number must not change the outcome.
        let err = client.fetch_opensea_events("0x503429", WINDOW).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let (base, _) = spawn_server(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (429, "{}".to_string())
            } else {
                (200, json!({"asset_events": []}).to_string())
            }
        })
        .await;
        let client = client_for(&base, "");
        assert!(client.fetch_opensea_events("0xABC", WINDOW).await.unwrap().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_status_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let (base, _) = spawn_server(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                (503, "{}".to_string())
            } else {
                (200, json!({"asset_events": [{"event_type": "bid_entered"}]}).to_string())
            }
        })
        .await;
        let client = client_for(&base, "");
        let labels = client.fetch_opensea_events("0xABC", WINDOW).await.unwrap();
        assert_eq!(labels, vec!["bid_entered"]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
