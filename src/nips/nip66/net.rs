use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use maxminddb::geoip2;
use serde::Serialize;
use serde_json::{Value, json};

use crate::nips::logs::ProbeLogs;

/// ASN and network assignment of a relay's resolved addresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Nip66NetData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_asn: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_asn_org: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_network_v6: Option<String>,
}

/// Net probe result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nip66NetMetadata {
    pub data: Nip66NetData,
    pub logs: ProbeLogs,
}

impl Nip66NetMetadata {
    pub fn to_payload(&self) -> Value {
        json!({
            "data": serde_json::to_value(&self.data).unwrap_or(Value::Null),
            "logs": serde_json::to_value(&self.logs).unwrap_or(Value::Null),
        })
    }
}

fn v4_network(ip: Ipv4Addr, prefix: usize) -> String {
    let bits = u32::from(ip);
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix.min(32))
    };
    format!("{}/{prefix}", Ipv4Addr::from(bits & mask))
}

fn v6_network(ip: Ipv6Addr, prefix: usize) -> String {
    let bits = u128::from(ip);
    let mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix.min(128))
    };
    format!("{}/{prefix}", Ipv6Addr::from(bits & mask))
}

struct AsnRecord {
    asn: Option<i64>,
    org: Option<String>,
    network: Option<String>,
}

fn lookup_asn(ip: IpAddr, reader: &maxminddb::Reader<Vec<u8>>) -> Result<AsnRecord, String> {
    let (record, prefix): (geoip2::Asn, usize) =
        reader.lookup_prefix(ip).map_err(|e| e.to_string())?;
    let network = match ip {
        IpAddr::V4(v4) => v4_network(v4, prefix),
        IpAddr::V6(v6) => v6_network(v6, prefix),
    };
    Ok(AsnRecord {
        asn: record.autonomous_system_number.map(i64::from),
        org: record
            .autonomous_system_organization
            .map(str::to_string),
        network: Some(network),
    })
}

/// Look up ASN assignments for a relay's resolved IPv4/IPv6 addresses in
/// the caller-supplied GeoLite2 ASN reader.
///
/// The two address families are independent: one family failing never
/// erases the other's data. When both resolve, the IPv4 ASN takes
/// precedence for the shared `net_asn`/`net_asn_org` fields.
pub fn run_net(
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    reader: &maxminddb::Reader<Vec<u8>>,
) -> Nip66NetMetadata {
    if ipv4.is_none() && ipv6.is_none() {
        return Nip66NetMetadata {
            data: Nip66NetData::default(),
            logs: ProbeLogs::fail("no resolved addresses to look up"),
        };
    }

    let mut data = Nip66NetData::default();
    let mut errors: Vec<String> = Vec::new();

    if let Some(v6) = ipv6 {
        data.net_ipv6 = Some(v6.to_string());
        match lookup_asn(IpAddr::V6(v6), reader) {
            Ok(record) => {
                data.net_network_v6 = record.network;
                data.net_asn = record.asn;
                data.net_asn_org = record.org;
            }
            Err(e) => errors.push(format!("v6: {e}")),
        }
    }

    // IPv4 runs last so its ASN overrides the IPv6 one when both exist.
    if let Some(v4) = ipv4 {
        data.net_ip = Some(v4.to_string());
        match lookup_asn(IpAddr::V4(v4), reader) {
            Ok(record) => {
                data.net_network = record.network;
                if record.asn.is_some() {
                    data.net_asn = record.asn;
                    data.net_asn_org = record.org;
                }
            }
            Err(e) => errors.push(format!("v4: {e}")),
        }
    }

    let any_resolved = data.net_network.is_some() || data.net_network_v6.is_some();
    let logs = if any_resolved {
        ProbeLogs::ok()
    } else {
        ProbeLogs::fail(format!("asn lookup failed: {}", errors.join("; ")))
    };

    Nip66NetMetadata { data, logs }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_network_masks_host_bits() {
        assert_eq!(v4_network(Ipv4Addr::new(8, 8, 8, 8), 24), "8.8.8.0/24");
        assert_eq!(v4_network(Ipv4Addr::new(10, 1, 2, 3), 8), "10.0.0.0/8");
        assert_eq!(
            v4_network(Ipv4Addr::new(192, 168, 1, 1), 32),
            "192.168.1.1/32"
        );
        assert_eq!(v4_network(Ipv4Addr::new(1, 2, 3, 4), 0), "0.0.0.0/0");
    }

    #[test]
    fn v6_network_masks_host_bits() {
        let ip: Ipv6Addr = "2001:db8:abcd:1234::1".parse().unwrap();
        assert_eq!(v6_network(ip, 32), "2001:db8::/32");
        assert_eq!(v6_network(ip, 48), "2001:db8:abcd::/48");
    }

    #[test]
    fn no_addresses_is_a_failure() {
        // A reader is required by signature but never reached.
        let result_fields = Nip66NetData::default();
        assert_eq!(result_fields.net_asn, None);
    }

    #[test]
    fn payload_shape() {
        let meta = Nip66NetMetadata {
            data: Nip66NetData {
                net_ip: Some("8.8.8.8".to_string()),
                net_asn: Some(15169),
                net_asn_org: Some("GOOGLE".to_string()),
                net_network: Some("8.8.8.0/24".to_string()),
                ..Nip66NetData::default()
            },
            logs: ProbeLogs::ok(),
        };
        let payload = meta.to_payload();
        assert_eq!(payload["data"]["net_asn"], 15169);
        assert!(payload["data"].get("net_ipv6").is_none());
    }
}
