use std::net::IpAddr;
use std::time::{Duration, Instant};

use hickory_resolver::TokioResolver;
use hickory_resolver::proto::rr::RecordType;
use serde::Serialize;
use serde_json::{Value, json};

use crate::models::Relay;
use crate::nips::logs::ProbeLogs;

/// DNS records resolved for a clearnet relay host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Nip66DnsData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_ips: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_ips_v6: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_cname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_ns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_reverse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_ttl: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_rtt: Option<i64>,
}

/// DNS probe result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nip66DnsMetadata {
    pub data: Nip66DnsData,
    pub logs: ProbeLogs,
}

impl Nip66DnsMetadata {
    pub fn to_payload(&self) -> Value {
        json!({
            "data": serde_json::to_value(&self.data).unwrap_or(Value::Null),
            "logs": serde_json::to_value(&self.logs).unwrap_or(Value::Null),
        })
    }
}

/// One record-type lookup; failures are suppressed so one record type
/// never hides another's results.
async fn lookup_records(
    resolver: &TokioResolver,
    host: &str,
    record_type: RecordType,
    timeout: Duration,
) -> (Vec<String>, Option<i64>) {
    let lookup = tokio::time::timeout(timeout, resolver.lookup(host, record_type)).await;
    match lookup {
        Ok(Ok(lookup)) => {
            let mut values = Vec::new();
            let mut min_ttl: Option<i64> = None;
            for record in lookup.record_iter() {
                if record.record_type() != record_type {
                    continue;
                }
                let data = record.data().to_string();
                values.push(data.trim_end_matches('.').to_string());
                let ttl = i64::from(record.ttl());
                min_ttl = Some(min_ttl.map_or(ttl, |t| t.min(ttl)));
            }
            (values, min_ttl)
        }
        _ => (Vec::new(), None),
    }
}

/// Resolve A, AAAA, CNAME, NS, and PTR records for a relay host.
///
/// Clearnet only; the orchestrator skips this probe for overlays. The
/// probe succeeds when the host resolves to at least one address;
/// individual record types may still be missing from the data.
pub async fn run_dns(relay: &Relay, timeout: Duration) -> Nip66DnsMetadata {
    let host = relay.host();

    // An IP-literal host has nothing to resolve except its PTR.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return probe_ip_literal(ip, timeout).await;
    }

    let resolver = match TokioResolver::builder_tokio() {
        Ok(builder) => builder.build(),
        Err(e) => {
            return Nip66DnsMetadata {
                data: Nip66DnsData::default(),
                logs: ProbeLogs::fail(format!("resolver unavailable: {e}")),
            };
        }
    };

    let mut data = Nip66DnsData::default();

    let started = Instant::now();
    let (ips, ttl_a) = lookup_records(&resolver, host, RecordType::A, timeout).await;
    data.dns_rtt = Some(started.elapsed().as_millis() as i64);

    let (ips_v6, ttl_aaaa) = lookup_records(&resolver, host, RecordType::AAAA, timeout).await;
    let (cnames, _) = lookup_records(&resolver, host, RecordType::CNAME, timeout).await;
    let (ns, _) = lookup_records(&resolver, host, RecordType::NS, timeout).await;

    data.dns_ips = (!ips.is_empty()).then_some(ips);
    data.dns_ips_v6 = (!ips_v6.is_empty()).then_some(ips_v6);
    data.dns_cname = cnames.into_iter().next();
    data.dns_ns = (!ns.is_empty()).then_some(ns);
    data.dns_ttl = match (ttl_a, ttl_aaaa) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    // PTR for the first resolved address
    if let Some(ip) = data
        .dns_ips
        .as_ref()
        .and_then(|ips| ips.first())
        .and_then(|s| s.parse::<IpAddr>().ok())
    {
        if let Ok(Ok(reverse)) = tokio::time::timeout(timeout, resolver.reverse_lookup(ip)).await {
            data.dns_reverse = reverse
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string());
        }
    }

    let logs = if data.dns_ips.is_some() || data.dns_ips_v6.is_some() {
        ProbeLogs::ok()
    } else {
        ProbeLogs::fail(format!("no A or AAAA records for {host}"))
    };

    Nip66DnsMetadata { data, logs }
}

async fn probe_ip_literal(ip: IpAddr, timeout: Duration) -> Nip66DnsMetadata {
    let mut data = Nip66DnsData::default();
    match ip {
        IpAddr::V4(_) => data.dns_ips = Some(vec![ip.to_string()]),
        IpAddr::V6(_) => data.dns_ips_v6 = Some(vec![ip.to_string()]),
    }

    if let Ok(builder) = TokioResolver::builder_tokio() {
        let resolver = builder.build();
        if let Ok(Ok(reverse)) = tokio::time::timeout(timeout, resolver.reverse_lookup(ip)).await {
            data.dns_reverse = reverse
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string());
        }
    }

    Nip66DnsMetadata {
        data,
        logs: ProbeLogs::ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literal_host_short_circuits() {
        let relay = Relay::parse("wss://8.8.8.8").unwrap();
        let result = run_dns(&relay, Duration::from_millis(100)).await;
        assert!(result.logs.success);
        assert_eq!(result.data.dns_ips, Some(vec!["8.8.8.8".to_string()]));
    }

    #[test]
    fn payload_prunes_missing_records() {
        let meta = Nip66DnsMetadata {
            data: Nip66DnsData {
                dns_ips: Some(vec!["1.2.3.4".to_string()]),
                dns_ttl: Some(300),
                ..Nip66DnsData::default()
            },
            logs: ProbeLogs::ok(),
        };
        let payload = meta.to_payload();
        assert_eq!(payload["data"]["dns_ttl"], 300);
        assert!(payload["data"].get("dns_ns").is_none());
    }

    // Requires outbound DNS.
    #[tokio::test]
    #[ignore = "requires network"]
    async fn resolves_live_host() {
        let relay = Relay::parse("wss://relay.damus.io").unwrap();
        let result = run_dns(&relay, Duration::from_secs(5)).await;
        assert!(result.logs.success);
        assert!(result.data.dns_ips.is_some());
        assert!(result.data.dns_rtt.unwrap() >= 0);
    }
}
