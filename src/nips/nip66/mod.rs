use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use serde::Deserialize;

use crate::error::ProtocolError;
use crate::models::{Metadata, MetadataType, Relay, RelayMetadata, now_ts};

pub mod dns;
pub mod geo;
pub mod http;
pub mod net;
pub mod rtt;
pub mod ssl;

pub use dns::{Nip66DnsData, Nip66DnsMetadata, run_dns};
pub use geo::{GEOHASH_PRECISION, Nip66GeoData, Nip66GeoMetadata, geohash, run_geo};
pub use http::{Nip66HttpData, Nip66HttpMetadata, run_http};
pub use net::{Nip66NetData, Nip66NetMetadata, run_net};
pub use rtt::{Nip66RttData, Nip66RttLogs, Nip66RttMetadata, run_rtt};
pub use ssl::{Nip66SslData, Nip66SslMetadata, run_ssl};

/// Which of the six NIP-66 dimensions to run.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Nip66Selection {
    pub rtt: bool,
    pub ssl: bool,
    pub geo: bool,
    pub net: bool,
    pub dns: bool,
    pub http: bool,
}

impl Default for Nip66Selection {
    fn default() -> Self {
        Self {
            rtt: true,
            ssl: true,
            geo: true,
            net: true,
            dns: true,
            http: true,
        }
    }
}

impl Nip66Selection {
    /// Names of the enabled checks, for the monitor announcement event.
    pub fn enabled_checks(&self) -> Vec<&'static str> {
        let mut checks = Vec::new();
        if self.rtt {
            checks.push("rtt");
        }
        if self.ssl {
            checks.push("ssl");
        }
        if self.geo {
            checks.push("geo");
        }
        if self.net {
            checks.push("net");
        }
        if self.dns {
            checks.push("dns");
        }
        if self.http {
            checks.push("http");
        }
        checks
    }
}

/// GeoLite2 database reader shared across probes.
pub type GeoReader = Arc<maxminddb::Reader<Vec<u8>>>;

/// Explicitly supplied dependencies for the probes.
///
/// A test whose dependencies are absent is silently skipped, so a
/// monitor without GeoIP databases still collects the other dimensions.
#[derive(Debug, Clone, Default)]
pub struct Nip66Dependencies {
    pub keys: Option<Keys>,
    pub event_builder: Option<EventBuilder>,
    pub read_filter: Option<Filter>,
    pub city_reader: Option<GeoReader>,
    pub asn_reader: Option<GeoReader>,
}

/// Collected NIP-66 observations for one relay.
///
/// One optional container per dimension; a failed test yields a
/// container with failure logs, a skipped test yields `None`.
#[derive(Debug, Clone, Default)]
pub struct Nip66 {
    pub rtt: Option<Nip66RttMetadata>,
    pub ssl: Option<Nip66SslMetadata>,
    pub geo: Option<Nip66GeoMetadata>,
    pub net: Option<Nip66NetMetadata>,
    pub dns: Option<Nip66DnsMetadata>,
    pub http: Option<Nip66HttpMetadata>,
    pub generated_at: i64,
}

/// Resolve a clearnet host to its first IPv4 and IPv6 addresses.
///
/// The two families are independent; either may be absent.
async fn resolve_host(host: &str, timeout: Duration) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => (Some(v4), None),
            IpAddr::V6(v6) => (None, Some(v6)),
        };
    }

    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0))).await;
    let mut v4 = None;
    let mut v6 = None;
    if let Ok(Ok(addrs)) = lookup {
        for addr in addrs {
            match addr.ip() {
                IpAddr::V4(ip) if v4.is_none() => v4 = Some(ip),
                IpAddr::V6(ip) if v6.is_none() => v6 = Some(ip),
                _ => {}
            }
        }
    }
    (v4, v6)
}

/// Run the enabled NIP-66 checks against a relay.
///
/// The six tests are independent: each is wrapped so a failure produces
/// a failure log instead of cancelling its siblings, and clearnet-only
/// tests are skipped for overlay relays (SSL records an explicit
/// failure there instead, so monitors can tell "not checked" from
/// "cannot apply").
pub async fn probe(
    relay: &Relay,
    selection: &Nip66Selection,
    deps: &Nip66Dependencies,
    proxy_url: Option<&str>,
    timeout: Duration,
    allow_insecure: bool,
) -> Nip66 {
    let is_overlay = relay.network().is_overlay();
    let mut result = Nip66 {
        generated_at: now_ts(),
        ..Nip66::default()
    };

    // Address resolution feeds geo and net; only clearnet hosts resolve.
    let needs_ip = !is_overlay
        && ((selection.geo && deps.city_reader.is_some())
            || (selection.net && deps.asn_reader.is_some()));
    let (ipv4, ipv6) = if needs_ip {
        resolve_host(relay.host(), timeout).await
    } else {
        (None, None)
    };

    let rtt_enabled = selection.rtt
        && deps.keys.is_some()
        && deps.event_builder.is_some()
        && deps.read_filter.is_some();

    let rtt_fut = async {
        if !rtt_enabled {
            return None;
        }
        Some(
            run_rtt(
                relay,
                deps.keys.as_ref().expect("checked above"),
                deps.event_builder.as_ref().expect("checked above"),
                deps.read_filter.as_ref().expect("checked above"),
                proxy_url,
                timeout,
                allow_insecure,
            )
            .await,
        )
    };

    let ssl_fut = async {
        if !selection.ssl {
            return None;
        }
        Some(run_ssl(relay, timeout).await)
    };

    let dns_fut = async {
        if !selection.dns || is_overlay {
            return None;
        }
        Some(run_dns(relay, timeout).await)
    };

    let http_fut = async {
        if !selection.http {
            return None;
        }
        Some(run_http(relay, proxy_url, timeout).await)
    };

    let (rtt, ssl, dns, http) = tokio::join!(rtt_fut, ssl_fut, dns_fut, http_fut);
    result.rtt = rtt;
    result.ssl = ssl;
    result.dns = dns;
    result.http = http;

    if selection.geo && !is_overlay {
        if let Some(reader) = deps.city_reader.as_ref() {
            let ip = ipv4.map(IpAddr::V4).or(ipv6.map(IpAddr::V6));
            result.geo = ip.map(|ip| run_geo(ip, reader));
        }
    }

    if selection.net && !is_overlay {
        if let Some(reader) = deps.asn_reader.as_ref() {
            if ipv4.is_some() || ipv6.is_some() {
                result.net = Some(run_net(ipv4, ipv6, reader));
            }
        }
    }

    result
}

impl Nip66 {
    /// Database records for every collected dimension, sharing one
    /// `generated_at` timestamp.
    pub fn to_relay_metadata(&self, relay: &Relay) -> Result<Vec<RelayMetadata>, ProtocolError> {
        let mut records = Vec::new();
        let mut push = |metadata_type: MetadataType,
                        payload: Option<serde_json::Value>|
         -> Result<(), ProtocolError> {
            if let Some(payload) = payload {
                records.push(RelayMetadata::new(
                    relay.clone(),
                    Metadata::new(metadata_type, payload)?,
                    self.generated_at,
                )?);
            }
            Ok(())
        };

        push(MetadataType::Nip66Rtt, self.rtt.as_ref().map(|m| m.to_payload()))?;
        push(MetadataType::Nip66Ssl, self.ssl.as_ref().map(|m| m.to_payload()))?;
        push(MetadataType::Nip66Geo, self.geo.as_ref().map(|m| m.to_payload()))?;
        push(MetadataType::Nip66Net, self.net.as_ref().map(|m| m.to_payload()))?;
        push(MetadataType::Nip66Dns, self.dns.as_ref().map(|m| m.to_payload()))?;
        push(MetadataType::Nip66Http, self.http.as_ref().map(|m| m.to_payload()))?;
        Ok(records)
    }

    /// True when at least one dimension reported success.
    pub fn any_success(&self) -> bool {
        self.rtt.as_ref().is_some_and(|m| m.logs.open_success)
            || self.ssl.as_ref().is_some_and(|m| m.logs.success)
            || self.geo.as_ref().is_some_and(|m| m.logs.success)
            || self.net.as_ref().is_some_and(|m| m.logs.success)
            || self.dns.as_ref().is_some_and(|m| m.logs.success)
            || self.http.as_ref().is_some_and(|m| m.logs.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nips::logs::ProbeLogs;

    fn tor_relay() -> Relay {
        Relay::parse("ws://oxtrdevav64z64yb7x6rjg4ntzqjhedm5b5zjqulugknhzr46ny2qbad.onion")
            .unwrap()
    }

    #[test]
    fn selection_default_enables_all() {
        let selection = Nip66Selection::default();
        assert_eq!(
            selection.enabled_checks(),
            vec!["rtt", "ssl", "geo", "net", "dns", "http"]
        );
    }

    #[test]
    fn selection_subset() {
        let selection = Nip66Selection {
            rtt: true,
            ssl: false,
            geo: false,
            net: false,
            dns: true,
            http: false,
        };
        assert_eq!(selection.enabled_checks(), vec!["rtt", "dns"]);
    }

    #[tokio::test]
    async fn overlay_skips_clearnet_only_tests() {
        // No RTT deps, no proxy: everything but SSL/HTTP is skipped, and
        // those two record explicit failures without network access.
        let relay = tor_relay();
        let selection = Nip66Selection::default();
        let deps = Nip66Dependencies::default();

        let result = probe(&relay, &selection, &deps, None, Duration::from_secs(1), false).await;
        assert!(result.rtt.is_none(), "rtt skipped without dependencies");
        assert!(result.dns.is_none(), "dns skipped for overlay");
        assert!(result.geo.is_none(), "geo skipped for overlay");
        assert!(result.net.is_none(), "net skipped for overlay");

        let ssl = result.ssl.expect("ssl records an explicit failure");
        assert!(!ssl.logs.success);
        let http = result.http.expect("http records missing proxy");
        assert!(!http.logs.success);
    }

    #[tokio::test]
    async fn missing_dependencies_skip_tests_silently() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let selection = Nip66Selection {
            rtt: true,
            geo: true,
            net: true,
            ssl: false,
            dns: false,
            http: false,
        };
        let deps = Nip66Dependencies::default();

        let result = probe(&relay, &selection, &deps, None, Duration::from_millis(50), false)
            .await;
        assert!(result.rtt.is_none());
        assert!(result.geo.is_none());
        assert!(result.net.is_none());
    }

    #[test]
    fn to_relay_metadata_emits_one_record_per_dimension() {
        let relay = Relay::parse("wss://relay.example.com").unwrap();
        let nip66 = Nip66 {
            rtt: Some(Nip66RttMetadata::default()),
            dns: Some(Nip66DnsMetadata {
                data: Nip66DnsData::default(),
                logs: ProbeLogs::fail("no records"),
            }),
            generated_at: 1_700_000_000,
            ..Nip66::default()
        };

        let records = nip66.to_relay_metadata(&relay).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].metadata.metadata_type(), MetadataType::Nip66Rtt);
        assert_eq!(records[1].metadata.metadata_type(), MetadataType::Nip66Dns);
        assert!(records.iter().all(|r| r.generated_at == 1_700_000_000));
    }

    #[test]
    fn any_success_reflects_logs() {
        let mut nip66 = Nip66::default();
        assert!(!nip66.any_success());

        nip66.dns = Some(Nip66DnsMetadata {
            data: Nip66DnsData::default(),
            logs: ProbeLogs::ok(),
        });
        assert!(nip66.any_success());
    }
}
