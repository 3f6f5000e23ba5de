//! Tag builders for Kind 30166 relay discovery events.
//!
//! Pure functions of typed NIP-11/NIP-66 data; the publisher composes
//! their output into events.

use nostr_sdk::prelude::*;

use crate::models::Relay;
use crate::nips::nip11::Nip11Info;
use crate::nips::nip66::{Nip66GeoData, Nip66NetData, Nip66RttData};

fn tag(kind: &str, values: impl IntoIterator<Item = String>) -> Tag {
    Tag::custom(TagKind::custom(kind.to_string()), values)
}

/// `d` identifier plus the relay's network.
pub fn identity_tags(relay: &Relay) -> Vec<Tag> {
    vec![
        Tag::identifier(relay.url().to_string()),
        tag("n", [relay.network().as_str().to_string()]),
    ]
}

/// One `N` tag per supported NIP.
pub fn nip_tags(info: &Nip11Info) -> Vec<Tag> {
    info.supported_nips
        .iter()
        .flatten()
        .map(|nip| tag("N", [nip.to_string()]))
        .collect()
}

/// One `l` tag per advertised language, marked ISO-639-1.
pub fn language_tags(info: &Nip11Info) -> Vec<Tag> {
    info.language_tags
        .iter()
        .flatten()
        .map(|lang| tag("l", [lang.clone(), "ISO-639-1".to_string()]))
        .collect()
}

/// `R` requirement tags: `auth`/`!auth` and `payment`/`!payment`, only
/// when the NIP-11 document states them.
pub fn requirement_tags(info: &Nip11Info) -> Vec<Tag> {
    let mut tags = Vec::new();
    if let Some(auth) = info.limitation.auth_required {
        tags.push(tag("R", [if auth { "auth" } else { "!auth" }.to_string()]));
    }
    if let Some(payment) = info.limitation.payment_required {
        tags.push(tag(
            "R",
            [if payment { "payment" } else { "!payment" }.to_string()],
        ));
    }
    tags
}

/// One `t` tag per self-declared relay topic tag.
pub fn type_tags(info: &Nip11Info) -> Vec<Tag> {
    info.tags
        .iter()
        .flatten()
        .map(|topic| tag("t", [topic.clone()]))
        .collect()
}

/// Geohash and country tags from the geo dimension.
pub fn geo_tags(geo: &Nip66GeoData) -> Vec<Tag> {
    let mut tags = Vec::new();
    if let Some(ref hash) = geo.geo_hash {
        tags.push(tag("g", [hash.clone()]));
    }
    if let Some(ref country) = geo.geo_country {
        tags.push(tag("p", [country.clone(), "countryCode".to_string()]));
    }
    tags
}

/// ASN tag from the net dimension.
pub fn asn_tags(net: &Nip66NetData) -> Vec<Tag> {
    net.net_asn
        .map(|asn| vec![tag("a", [asn.to_string()])])
        .unwrap_or_default()
}

/// Round-trip time tags, one per measured phase.
pub fn rtt_tags(rtt: &Nip66RttData) -> Vec<Tag> {
    let mut tags = Vec::new();
    if let Some(ms) = rtt.rtt_open {
        tags.push(tag("rtt-open", [ms.to_string()]));
    }
    if let Some(ms) = rtt.rtt_read {
        tags.push(tag("rtt-read", [ms.to_string()]));
    }
    if let Some(ms) = rtt.rtt_write {
        tags.push(tag("rtt-write", [ms.to_string()]));
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag_vec(tag: &Tag) -> Vec<String> {
        tag.as_slice().to_vec()
    }

    fn info_from(value: serde_json::Value) -> Nip11Info {
        Nip11Info::parse(&value)
    }

    #[test]
    fn identity_includes_d_and_network() {
        let relay = Relay::parse("wss://relay.damus.io").unwrap();
        let tags = identity_tags(&relay);
        assert_eq!(tag_vec(&tags[0]), vec!["d", "wss://relay.damus.io"]);
        assert_eq!(tag_vec(&tags[1]), vec!["n", "clearnet"]);
    }

    #[test]
    fn nip_tags_one_per_nip() {
        let info = info_from(json!({"supported_nips": [1, 11, 42]}));
        let tags = nip_tags(&info);
        assert_eq!(tags.len(), 3);
        assert_eq!(tag_vec(&tags[0]), vec!["N", "1"]);
        assert_eq!(tag_vec(&tags[2]), vec!["N", "42"]);
    }

    #[test]
    fn nip_tags_empty_without_nips() {
        assert!(nip_tags(&Nip11Info::default()).is_empty());
    }

    #[test]
    fn language_tags_carry_iso_marker() {
        let info = info_from(json!({"language_tags": ["en", "pt"]}));
        let tags = language_tags(&info);
        assert_eq!(tag_vec(&tags[0]), vec!["l", "en", "ISO-639-1"]);
        assert_eq!(tag_vec(&tags[1]), vec!["l", "pt", "ISO-639-1"]);
    }

    #[test]
    fn requirement_tags_positive_and_negative() {
        let info = info_from(json!({"limitation": {"auth_required": true, "payment_required": false}}));
        let tags = requirement_tags(&info);
        assert_eq!(tag_vec(&tags[0]), vec!["R", "auth"]);
        assert_eq!(tag_vec(&tags[1]), vec!["R", "!payment"]);
    }

    #[test]
    fn requirement_tags_absent_when_unstated() {
        assert!(requirement_tags(&Nip11Info::default()).is_empty());
    }

    #[test]
    fn type_tags_from_nip11_topics() {
        let info = info_from(json!({"tags": ["sfw-only", "bitcoin"]}));
        let tags = type_tags(&info);
        assert_eq!(tag_vec(&tags[0]), vec!["t", "sfw-only"]);
    }

    #[test]
    fn geo_tags_hash_and_country() {
        let geo = Nip66GeoData {
            geo_hash: Some("u4pruydqq".to_string()),
            geo_country: Some("DK".to_string()),
            ..Nip66GeoData::default()
        };
        let tags = geo_tags(&geo);
        assert_eq!(tag_vec(&tags[0]), vec!["g", "u4pruydqq"]);
        assert_eq!(tag_vec(&tags[1]), vec!["p", "DK", "countryCode"]);
    }

    #[test]
    fn geo_tags_empty_without_data() {
        assert!(geo_tags(&Nip66GeoData::default()).is_empty());
    }

    #[test]
    fn asn_tag_present_only_with_asn() {
        let net = Nip66NetData {
            net_asn: Some(15169),
            ..Nip66NetData::default()
        };
        assert_eq!(tag_vec(&asn_tags(&net)[0]), vec!["a", "15169"]);
        assert!(asn_tags(&Nip66NetData::default()).is_empty());
    }

    #[test]
    fn rtt_tags_skip_unmeasured_phases() {
        let rtt = Nip66RttData {
            rtt_open: Some(120),
            rtt_read: None,
            rtt_write: Some(340),
        };
        let tags = rtt_tags(&rtt);
        assert_eq!(tags.len(), 2);
        assert_eq!(tag_vec(&tags[0]), vec!["rtt-open", "120"]);
        assert_eq!(tag_vec(&tags[1]), vec!["rtt-write", "340"]);
    }
}
