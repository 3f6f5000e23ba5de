use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use nostr_sdk::prelude::*;
use ::url::Url;

use crate::error::{ConnectivityError, ProtocolError};
use crate::models::{Event, Relay};

mod insecure;

pub use insecure::InsecureWebSocketTransport;
pub(crate) use insecure::insecure_client_config;

/// Default timeout for relay network operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Multi-word patterns for TLS certificate errors in client error
/// messages. Single keywords like "verify" or "handshake" are avoided to
/// prevent false positives from unrelated errors (e.g. DNS "cannot
/// verify hostname").
const SSL_ERROR_PATTERNS: &[&str] = &[
    "ssl certificate",
    "certificate verify",
    "certificate has expired",
    "self signed certificate",
    "self-signed certificate",
    "unable to get local issuer",
    "x509",
    "tlsv1 alert",
    "ssl handshake",
    "tls handshake failed",
    "certificate_unknown",
    "certificate_expired",
    "ssl error",
    "tls error",
    "cert verify failed",
    "invalid peer certificate",
    "unknownissuer",
    "certnotvalidforname",
];

/// Check whether an error message indicates a TLS certificate failure.
pub fn is_ssl_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    SSL_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Resolve a SOCKS5 proxy URL to a socket address.
///
/// The proxy connection needs a numeric address; hostnames are resolved
/// asynchronously through the system resolver.
pub async fn resolve_proxy_addr(proxy_url: &str) -> Result<SocketAddr, ConnectivityError> {
    let parsed = Url::parse(proxy_url).map_err(|e| ConnectivityError::Failed {
        relay: proxy_url.to_string(),
        reason: format!("invalid proxy URL: {e}"),
    })?;

    let host = parsed
        .host_str()
        .unwrap_or("127.0.0.1")
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = parsed.port().unwrap_or(9050);

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| ConnectivityError::Failed {
            relay: proxy_url.to_string(),
            reason: format!("proxy resolution failed: {e}"),
        })?;
    addrs.next().ok_or_else(|| ConnectivityError::Failed {
        relay: proxy_url.to_string(),
        reason: "proxy hostname resolved to no addresses".to_string(),
    })
}

/// Build a Nostr client for a `(keys?, proxy?, allow_insecure)` tuple.
///
/// The caller adds relays and connects. With a proxy, all relay
/// connections are routed through SOCKS5. With `allow_insecure`, the
/// certificate-verification-disabled transport is installed; only the
/// fallback path in [`connect_relay`] does this.
pub fn create_client(
    keys: Option<&Keys>,
    proxy: Option<SocketAddr>,
    allow_insecure: bool,
) -> Client {
    let mut builder = Client::builder();

    if let Some(keys) = keys {
        builder = builder.signer(keys.clone());
    }

    if allow_insecure {
        builder = builder.websocket_transport(InsecureWebSocketTransport);
    }

    if let Some(addr) = proxy {
        let connection = Connection::new().proxy(addr).target(ConnectionTarget::All);
        builder = builder.opts(Options::new().connection(connection));
    }

    builder.build()
}

fn relay_url(relay: &Relay) -> Result<RelayUrl, ConnectivityError> {
    RelayUrl::parse(relay.url()).map_err(|e| ConnectivityError::Failed {
        relay: relay.url().to_string(),
        reason: format!("unparseable relay URL: {e}"),
    })
}

async fn try_connect_once(
    client: &Client,
    url: &RelayUrl,
    timeout: Duration,
) -> Result<(), String> {
    client
        .add_relay(url.clone())
        .await
        .map_err(|e| e.to_string())?;
    let relay = client.relay(url).await.map_err(|e| e.to_string())?;
    relay.try_connect(timeout).await.map_err(|e| e.to_string())
}

/// Connect to a relay, with automatic SSL fallback on clearnet.
///
/// Overlay relays require a proxy and never fall back (the overlay
/// itself encrypts). Clearnet relays try verified TLS first; on a
/// TLS-classified failure with `allow_insecure`, the client is torn down
/// and rebuilt with certificate verification disabled. Non-TLS failures
/// never fall back.
pub async fn connect_relay(
    relay: &Relay,
    keys: Option<&Keys>,
    proxy_url: Option<&str>,
    timeout: Duration,
    allow_insecure: bool,
) -> Result<Client, ConnectivityError> {
    let url = relay_url(relay)?;

    if relay.network().is_overlay() {
        let proxy_url = proxy_url.ok_or_else(|| ConnectivityError::ProxyRequired {
            network: relay.network().to_string(),
            relay: relay.url().to_string(),
        })?;
        let addr = resolve_proxy_addr(proxy_url).await?;

        let client = create_client(keys, Some(addr), false);
        if let Err(reason) = try_connect_once(&client, &url, timeout).await {
            client.disconnect().await;
            return Err(ConnectivityError::Failed {
                relay: relay.url().to_string(),
                reason,
            });
        }
        return Ok(client);
    }

    tracing::debug!(target: "bigbrotr::transport", "ssl_connecting relay={}", relay.url());

    let client = create_client(keys, None, false);
    match try_connect_once(&client, &url, timeout).await {
        Ok(()) => {
            tracing::debug!(target: "bigbrotr::transport", "ssl_connected relay={}", relay.url());
            return Ok(client);
        }
        Err(reason) => {
            client.disconnect().await;
            tracing::debug!(
                target: "bigbrotr::transport",
                "connect_failed relay={} error={reason}",
                relay.url()
            );

            if !is_ssl_error(&reason) {
                return Err(ConnectivityError::Failed {
                    relay: relay.url().to_string(),
                    reason,
                });
            }
            if !allow_insecure {
                return Err(ConnectivityError::Ssl {
                    relay: relay.url().to_string(),
                    reason,
                });
            }

            tracing::debug!(
                target: "bigbrotr::transport",
                "ssl_fallback_insecure relay={} error={reason}",
                relay.url()
            );
        }
    }

    let client = create_client(keys, None, true);
    match try_connect_once(&client, &url, timeout).await {
        Ok(()) => {
            crate::metrics::inc_counter("ssl_fallback", 1);
            tracing::debug!(target: "bigbrotr::transport", "insecure_connected relay={}", relay.url());
            Ok(client)
        }
        Err(reason) => {
            client.disconnect().await;
            Err(ConnectivityError::Failed {
                relay: relay.url().to_string(),
                reason: format!("insecure fallback failed: {reason}"),
            })
        }
    }
}

/// Check whether a URL hosts a Nostr relay via a protocol handshake.
///
/// A relay is valid when it answers a minimal REQ with EOSE, challenges
/// with AUTH (NIP-42), or closes the subscription with "auth-required".
/// Any other protocol behavior classifies as "not a relay"; a missing
/// overlay proxy surfaces as an error so the caller can treat it as a
/// configuration problem instead of a relay failure.
pub async fn is_nostr_relay(
    relay: &Relay,
    proxy_url: Option<&str>,
    timeout: Duration,
    overall_timeout: Option<Duration>,
    allow_insecure: bool,
) -> Result<bool, ConnectivityError> {
    // Covers the verified attempt, teardown, insecure retry, and fetch.
    let overall = overall_timeout.unwrap_or(timeout * 4);

    tracing::debug!(
        target: "bigbrotr::transport",
        "validation_started relay={} timeout_s={}",
        relay.url(),
        timeout.as_secs()
    );

    let probe = async {
        let client = connect_relay(relay, None, proxy_url, timeout, allow_insecure).await?;

        let filter = Filter::new().kind(Kind::TextNote).limit(1);
        let result = client.fetch_events(filter, timeout).await;
        client.disconnect().await;

        match result {
            Ok(_) => {
                tracing::debug!(
                    target: "bigbrotr::transport",
                    "validation_success relay={} reason=eose",
                    relay.url()
                );
                Ok(true)
            }
            Err(e) => {
                let message = e.to_string().to_lowercase();
                if message.contains("auth-required") || message.contains("auth required") {
                    tracing::debug!(
                        target: "bigbrotr::transport",
                        "validation_success relay={} reason=auth-required",
                        relay.url()
                    );
                    Ok(true)
                } else {
                    tracing::debug!(
                        target: "bigbrotr::transport",
                        "validation_failed relay={} error={message}",
                        relay.url()
                    );
                    Ok(false)
                }
            }
        }
    };

    match tokio::time::timeout(overall, probe).await {
        Ok(result) => match result {
            Ok(valid) => Ok(valid),
            // Missing proxy is a configuration problem, not a relay verdict.
            Err(err @ ConnectivityError::ProxyRequired { .. }) => Err(err),
            Err(e) => {
                tracing::debug!(
                    target: "bigbrotr::transport",
                    "validation_failed relay={} error={e}",
                    relay.url()
                );
                Ok(false)
            }
        },
        Err(_) => {
            tracing::debug!(target: "bigbrotr::transport", "validation_timeout relay={}", relay.url());
            Ok(false)
        }
    }
}

/// Sign and broadcast event builders to relays.
///
/// One client per relay so SSL fallback applies independently. Relays
/// that fail to connect or send are logged and skipped. Returns the
/// number of relays that received every event.
pub async fn broadcast_events(
    builders: &[EventBuilder],
    relays: &[Relay],
    keys: &Keys,
    timeout: Duration,
    allow_insecure: bool,
) -> usize {
    if builders.is_empty() || relays.is_empty() {
        return 0;
    }

    let mut success = 0usize;
    for relay in relays {
        let client = match connect_relay(relay, Some(keys), None, timeout, allow_insecure).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::transport",
                    "broadcast_connect_failed relay={} error={e}",
                    relay.url()
                );
                continue;
            }
        };

        let mut sent_all = true;
        for builder in builders {
            if let Err(e) = client.send_event_builder(builder.clone()).await {
                tracing::warn!(
                    target: "bigbrotr::transport",
                    "broadcast_send_failed relay={} error={e}",
                    relay.url()
                );
                sent_all = false;
                break;
            }
        }
        if sent_all {
            success += 1;
        }
        client.disconnect().await;
    }
    success
}

/// Fetch events matching a filter from one relay, yielding only
/// signature-verified events. Invalid signatures are dropped at debug
/// level; the consumer owns batching and cursor advancement.
pub async fn fetch_relay_events(
    relay: &Relay,
    filter: Filter,
    keys: Option<&Keys>,
    proxy_url: Option<&str>,
    timeout: Duration,
    allow_insecure: bool,
) -> Result<Vec<Event>, ConnectivityError> {
    let client = connect_relay(relay, keys, proxy_url, timeout, allow_insecure).await?;

    let result = client.fetch_events(filter, timeout).await;
    client.disconnect().await;

    let events = result.map_err(|e| ConnectivityError::Failed {
        relay: relay.url().to_string(),
        reason: e.to_string(),
    })?;

    let mut verified = Vec::with_capacity(events.len());
    for wire in events.into_iter() {
        match Event::from_nostr(&wire) {
            Ok(event) => verified.push(event),
            Err(ProtocolError::InvalidEvent(reason)) => {
                tracing::debug!(
                    target: "bigbrotr::transport",
                    "event_signature_invalid relay={} reason={reason}",
                    relay.url()
                );
            }
            Err(e) => {
                tracing::debug!(
                    target: "bigbrotr::transport",
                    "event_rejected relay={} error={e}",
                    relay.url()
                );
            }
        }
    }
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NetworkType;

    #[test]
    fn ssl_patterns_match_certificate_errors() {
        for message in [
            "SSL certificate problem",
            "certificate verify failed: unable to get local issuer certificate",
            "error: Self signed certificate in chain",
            "x509: certificate signed by unknown authority",
            "TLS handshake failed",
            "invalid peer certificate: UnknownIssuer",
            "received fatal TLSv1 alert",
        ] {
            assert!(is_ssl_error(message), "should classify: {message}");
        }
    }

    #[test]
    fn ssl_patterns_ignore_unrelated_errors() {
        for message in [
            "connection refused",
            "dns error: cannot verify hostname",
            "handshake incomplete",
            "timed out",
            "no route to host",
        ] {
            assert!(!is_ssl_error(message), "should not classify: {message}");
        }
    }

    #[tokio::test]
    async fn proxy_addr_from_ip_literal() {
        let addr = resolve_proxy_addr("socks5://127.0.0.1:9050").await.unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9050");
    }

    #[tokio::test]
    async fn proxy_addr_default_port() {
        let addr = resolve_proxy_addr("socks5://10.0.0.5").await.unwrap();
        assert_eq!(addr.port(), 9050);
    }

    #[tokio::test]
    async fn proxy_addr_ipv6_literal() {
        let addr = resolve_proxy_addr("socks5://[::1]:1080").await.unwrap();
        assert_eq!(addr.port(), 1080);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn proxy_addr_rejects_garbage() {
        assert!(resolve_proxy_addr("not a url").await.is_err());
    }

    #[tokio::test]
    async fn overlay_without_proxy_is_config_classified() {
        let relay = Relay::parse(
            "ws://oxtrdevav64z64yb7x6rjg4ntzqjhedm5b5zjqulugknhzr46ny2qbad.onion",
        )
        .unwrap();
        assert_eq!(relay.network(), NetworkType::Tor);

        // No proxy configured: classified before any network I/O.
        let err = connect_relay(&relay, None, None, DEFAULT_TIMEOUT, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::ProxyRequired { .. }));

        let err = is_nostr_relay(&relay, None, DEFAULT_TIMEOUT, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::ProxyRequired { .. }));
    }

    #[tokio::test]
    async fn create_client_accepts_all_configurations() {
        let keys = Keys::generate();
        let _ = create_client(None, None, false);
        let _ = create_client(Some(&keys), None, true);
        let addr: SocketAddr = "127.0.0.1:9050".parse().unwrap();
        let _ = create_client(Some(&keys), Some(addr), false);
    }
}
