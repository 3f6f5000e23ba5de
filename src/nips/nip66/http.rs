use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::Connector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderMap;

use crate::models::{Relay, RelayScheme};
use crate::nips::logs::ProbeLogs;
use crate::transport::{insecure_client_config, resolve_proxy_addr};

/// Server identification headers from the WebSocket handshake response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Nip66HttpData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_powered_by: Option<String>,
}

/// HTTP probe result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nip66HttpMetadata {
    pub data: Nip66HttpData,
    pub logs: ProbeLogs,
}

impl Nip66HttpMetadata {
    pub fn to_payload(&self) -> Value {
        json!({
            "data": serde_json::to_value(&self.data).unwrap_or(Value::Null),
            "logs": serde_json::to_value(&self.logs).unwrap_or(Value::Null),
        })
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            data: Nip66HttpData::default(),
            logs: ProbeLogs::fail(reason),
        }
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn from_headers(headers: &HeaderMap) -> Nip66HttpMetadata {
    Nip66HttpMetadata {
        data: Nip66HttpData {
            http_server: header(headers, "server"),
            http_powered_by: header(headers, "x-powered-by"),
        },
        logs: ProbeLogs::ok(),
    }
}

async fn handshake_direct(relay: &Relay, timeout: Duration) -> Result<Nip66HttpMetadata, String> {
    // Certificate validity is the SSL probe's concern; this probe only
    // wants the handshake response headers.
    let connector = Connector::Rustls(Arc::new(insecure_client_config()));
    let connect = tokio_tungstenite::connect_async_tls_with_config(
        relay.url(),
        None,
        false,
        Some(connector),
    );
    let (_socket, response) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| "handshake timed out".to_string())?
        .map_err(|e| e.to_string())?;
    Ok(from_headers(response.headers()))
}

async fn handshake_via_proxy(
    relay: &Relay,
    proxy_url: &str,
    timeout: Duration,
) -> Result<Nip66HttpMetadata, String> {
    let proxy_addr = resolve_proxy_addr(proxy_url)
        .await
        .map_err(|e| e.to_string())?;

    let target = (relay.host(), relay.effective_port());
    let stream = tokio::time::timeout(timeout, Socks5Stream::connect(proxy_addr, target))
        .await
        .map_err(|_| "proxy connect timed out".to_string())?
        .map_err(|e| format!("proxy connect failed: {e}"))?;

    let request = relay
        .url()
        .into_client_request()
        .map_err(|e| e.to_string())?;

    let response = match relay.scheme() {
        RelayScheme::Ws => {
            let handshake = tokio_tungstenite::client_async(request, stream);
            let (_socket, response) = tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| "handshake timed out".to_string())?
                .map_err(|e| e.to_string())?;
            response
        }
        RelayScheme::Wss => {
            let connector = Connector::Rustls(Arc::new(insecure_client_config()));
            let handshake = tokio_tungstenite::client_async_tls_with_config(
                request,
                stream,
                None,
                Some(connector),
            );
            let (_socket, response) = tokio::time::timeout(timeout, handshake)
                .await
                .map_err(|_| "handshake timed out".to_string())?
                .map_err(|e| e.to_string())?;
            response
        }
    };

    Ok(from_headers(response.headers()))
}

/// Capture `Server` and `X-Powered-By` from the relay's WebSocket
/// handshake response. Works on clearnet directly and on overlays
/// through the SOCKS5 proxy.
pub async fn run_http(
    relay: &Relay,
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Nip66HttpMetadata {
    let result = if relay.network().is_overlay() {
        match proxy_url {
            Some(proxy) => handshake_via_proxy(relay, proxy, timeout).await,
            None => Err(format!(
                "proxy_url required for {} relay",
                relay.network()
            )),
        }
    } else {
        handshake_direct(relay, timeout).await
    };

    match result {
        Ok(meta) => meta,
        Err(reason) => Nip66HttpMetadata::failed(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    #[test]
    fn extracts_identification_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("server", HeaderValue::from_static("nginx/1.24.0"));
        headers.insert("x-powered-by", HeaderValue::from_static("strfry"));
        let meta = from_headers(&headers);
        assert!(meta.logs.success);
        assert_eq!(meta.data.http_server.as_deref(), Some("nginx/1.24.0"));
        assert_eq!(meta.data.http_powered_by.as_deref(), Some("strfry"));
    }

    #[test]
    fn missing_headers_still_succeed() {
        let meta = from_headers(&HeaderMap::new());
        assert!(meta.logs.success);
        assert_eq!(meta.data.http_server, None);
    }

    #[tokio::test]
    async fn overlay_without_proxy_fails_before_io() {
        let relay = Relay::parse(
            "ws://oxtrdevav64z64yb7x6rjg4ntzqjhedm5b5zjqulugknhzr46ny2qbad.onion",
        )
        .unwrap();
        let meta = run_http(&relay, None, Duration::from_secs(5)).await;
        assert!(!meta.logs.success);
        assert!(meta.logs.reason.as_ref().unwrap().contains("proxy_url"));
    }

    // Requires outbound network access.
    #[tokio::test]
    #[ignore = "requires network"]
    async fn captures_live_headers() {
        let relay = Relay::parse("wss://relay.damus.io").unwrap();
        let meta = run_http(&relay, None, Duration::from_secs(10)).await;
        assert!(meta.logs.success);
    }
}
