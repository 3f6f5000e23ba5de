use std::time::Duration;

use serde_json::{Value, json};

use crate::error::ProtocolError;
use crate::models::{Metadata, MetadataType, Relay, RelayMetadata, now_ts};
use crate::nips::logs::ProbeLogs;
use crate::nips::nip11::data::Nip11Info;
use crate::transport::is_ssl_error;

/// Maximum accepted NIP-11 response body. A body of exactly this size is
/// accepted; one byte more is rejected before parsing.
pub const NIP11_MAX_BODY_SIZE: usize = 65_536;

/// Result of a NIP-11 information document fetch.
///
/// The fetch never errors: `logs.success` carries the outcome and a
/// failed fetch leaves `data` empty.
#[derive(Debug, Clone)]
pub struct Nip11Document {
    pub relay: Relay,
    pub data: Nip11Info,
    pub logs: ProbeLogs,
    pub generated_at: i64,
}

impl Nip11Document {
    /// Database record for this fetch.
    pub fn to_relay_metadata(&self) -> Result<RelayMetadata, ProtocolError> {
        let payload = json!({
            "data": self.data.to_json(),
            "logs": serde_json::to_value(&self.logs).unwrap_or(Value::Null),
        });
        RelayMetadata::new(
            self.relay.clone(),
            Metadata::new(MetadataType::Nip11Info, payload)?,
            self.generated_at,
        )
    }
}

fn http_client(
    proxy_url: Option<&str>,
    timeout: Duration,
    accept_invalid_certs: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs);
    if let Some(proxy) = proxy_url {
        // socks5h: the proxy resolves hostnames, required for overlays.
        let proxy = proxy.replace("socks5://", "socks5h://");
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    builder.build()
}

async fn fetch_once(
    http_url: &str,
    proxy_url: Option<&str>,
    timeout: Duration,
    max_size: usize,
    accept_invalid_certs: bool,
) -> Result<Value, String> {
    let client =
        http_client(proxy_url, timeout, accept_invalid_certs).map_err(|e| e.to_string())?;

    let mut response = client
        .get(http_url)
        .header(reqwest::header::ACCEPT, "application/nostr+json")
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(format!("HTTP {}", status.as_u16()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let base_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if base_type != "application/nostr+json" && base_type != "application/json" {
        return Err(format!("Invalid Content-Type: {content_type}"));
    }

    // Read at most max_size + 1 bytes; reject oversize before parsing.
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
        body.extend_from_slice(&chunk);
        if body.len() > max_size {
            return Err(format!("Response body too large: >{max_size} bytes"));
        }
    }

    let parsed: Value = serde_json::from_slice(&body).map_err(|e| e.to_string())?;
    if !parsed.is_object() {
        return Err(format!("Expected JSON object, got {}", json_type_name(&parsed)));
    }
    Ok(parsed)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Fetch a relay's NIP-11 information document over HTTP(S).
///
/// The relay's WebSocket URL is converted to HTTP(S) and requested with
/// `Accept: application/nostr+json`. Clearnet HTTPS verifies the
/// certificate first and falls back to an unverified request when
/// `allow_insecure` permits; overlay relays always use the unverified
/// path because the overlay itself encrypts.
///
/// Never fails: check `logs.success` on the returned document.
pub async fn fetch_nip11(
    relay: &Relay,
    proxy_url: Option<&str>,
    timeout: Duration,
    max_size: usize,
    allow_insecure: bool,
) -> Nip11Document {
    let http_url = relay.http_url();
    let is_overlay = relay.network().is_overlay();
    let https = http_url.starts_with("https://");

    let result = if is_overlay {
        fetch_once(&http_url, proxy_url, timeout, max_size, true).await
    } else if !https {
        fetch_once(&http_url, proxy_url, timeout, max_size, false).await
    } else {
        match fetch_once(&http_url, proxy_url, timeout, max_size, false).await {
            Ok(data) => Ok(data),
            Err(reason) if allow_insecure && is_ssl_error(&reason) => {
                tracing::debug!(
                    target: "bigbrotr::nips::nip11",
                    "nip11_ssl_fallback relay={} error={reason}",
                    relay.url()
                );
                fetch_once(&http_url, proxy_url, timeout, max_size, true).await
            }
            Err(reason) => Err(reason),
        }
    };

    let (data, logs) = match result {
        Ok(raw) => {
            let info = Nip11Info::parse(&raw);
            tracing::debug!(
                target: "bigbrotr::nips::nip11",
                "nip11_succeeded relay={} name={:?}",
                relay.url(),
                info.name
            );
            (info, ProbeLogs::ok())
        }
        Err(reason) => {
            tracing::debug!(
                target: "bigbrotr::nips::nip11",
                "nip11_failed relay={} error={reason}",
                relay.url()
            );
            (Nip11Info::default(), ProbeLogs::fail(reason))
        }
    };

    Nip11Document {
        relay: relay.clone(),
        data,
        logs,
        generated_at: now_ts(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_for(server: &mockito::Server) -> Relay {
        // The mock server listens on plain HTTP; a ws:// relay URL maps
        // onto it without TLS.
        let addr = server.host_with_port();
        Relay::parse(&format!("ws://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn fetch_parses_valid_document() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("accept", "application/nostr+json")
            .with_status(200)
            .with_header("content-type", "application/nostr+json")
            .with_body(r#"{"name": "test relay", "supported_nips": [1, 11]}"#)
            .create_async()
            .await;

        let relay = relay_for(&server);
        let doc = fetch_nip11(&relay, None, Duration::from_secs(5), NIP11_MAX_BODY_SIZE, false)
            .await;

        mock.assert_async().await;
        assert!(doc.logs.success);
        assert_eq!(doc.data.name.as_deref(), Some("test relay"));
        assert_eq!(doc.data.supported_nips, Some(vec![1, 11]));
    }

    #[tokio::test]
    async fn fetch_accepts_plain_json_content_type() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json; charset=utf-8")
            .with_body(r#"{"name": "r"}"#)
            .create_async()
            .await;

        let relay = relay_for(&server);
        let doc = fetch_nip11(&relay, None, Duration::from_secs(5), NIP11_MAX_BODY_SIZE, false)
            .await;
        assert!(doc.logs.success);
    }

    #[tokio::test]
    async fn fetch_rejects_wrong_content_type() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html></html>")
            .create_async()
            .await;

        let relay = relay_for(&server);
        let doc = fetch_nip11(&relay, None, Duration::from_secs(5), NIP11_MAX_BODY_SIZE, false)
            .await;
        assert!(!doc.logs.success);
        assert!(doc.logs.reason.as_ref().unwrap().contains("Content-Type"));
    }

    #[tokio::test]
    async fn fetch_rejects_non_200() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(404)
            .create_async()
            .await;

        let relay = relay_for(&server);
        let doc = fetch_nip11(&relay, None, Duration::from_secs(5), NIP11_MAX_BODY_SIZE, false)
            .await;
        assert!(!doc.logs.success);
        assert_eq!(doc.logs.reason.as_deref(), Some("HTTP 404"));
    }

    #[tokio::test]
    async fn fetch_rejects_non_object_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[1, 2, 3]")
            .create_async()
            .await;

        let relay = relay_for(&server);
        let doc = fetch_nip11(&relay, None, Duration::from_secs(5), NIP11_MAX_BODY_SIZE, false)
            .await;
        assert!(!doc.logs.success);
        assert!(doc.logs.reason.as_ref().unwrap().contains("Expected JSON object"));
    }

    #[tokio::test]
    async fn body_size_boundary() {
        // Exactly max bytes: accepted. One more: rejected before parse.
        let max = 64;
        let exact = format!(r#"{{"name": "{}"}}"#, "a".repeat(max - 12));
        assert_eq!(exact.len(), max);

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(&exact)
            .create_async()
            .await;
        let relay = relay_for(&server);
        let doc = fetch_nip11(&relay, None, Duration::from_secs(5), max, false).await;
        assert!(doc.logs.success, "exact-size body must parse");

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("a".repeat(max + 1))
            .create_async()
            .await;
        let relay = relay_for(&server);
        let doc = fetch_nip11(&relay, None, Duration::from_secs(5), max, false).await;
        assert!(!doc.logs.success);
        assert!(doc.logs.reason.as_ref().unwrap().contains("too large"));
    }

    #[tokio::test]
    async fn malformed_fields_are_dropped_not_fatal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/nostr+json")
            .with_body(r#"{"name": 7, "version": "1.0", "supported_nips": ["x"]}"#)
            .create_async()
            .await;

        let relay = relay_for(&server);
        let doc = fetch_nip11(&relay, None, Duration::from_secs(5), NIP11_MAX_BODY_SIZE, false)
            .await;
        assert!(doc.logs.success);
        assert_eq!(doc.data.name, None);
        assert_eq!(doc.data.version.as_deref(), Some("1.0"));
        assert_eq!(doc.data.supported_nips, None);
    }

    #[tokio::test]
    async fn to_relay_metadata_carries_logs() {
        let relay = Relay::parse("wss://unreachable.invalid").unwrap();
        let doc = Nip11Document {
            relay: relay.clone(),
            data: Nip11Info::default(),
            logs: ProbeLogs::fail("HTTP 500"),
            generated_at: 1_700_000_000,
        };
        let rm = doc.to_relay_metadata().unwrap();
        assert_eq!(rm.metadata.metadata_type(), MetadataType::Nip11Info);
        assert_eq!(rm.metadata.payload()["logs"]["success"], false);
        assert_eq!(rm.generated_at, 1_700_000_000);
    }
}
