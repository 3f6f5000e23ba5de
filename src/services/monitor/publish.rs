//! Builders and broadcast for the monitor's published Nostr events:
//! Kind 0 profile, Kind 10166 monitor announcement, and Kind 30166
//! per-relay discovery events.

use nostr_sdk::prelude::*;

use crate::models::Relay;
use crate::nips::nip11::Nip11Document;
use crate::nips::nip66::{Nip66, Nip66Selection};
use crate::services::monitor::config::{ProfileConfig, PublishingConfig};
use crate::services::monitor::tags;

/// Kind of the NIP-66 monitor announcement event.
pub const KIND_MONITOR_ANNOUNCEMENT: u16 = 10_166;
/// Kind of the NIP-66 relay discovery event.
pub const KIND_RELAY_DISCOVERY: u16 = 30_166;

/// Kind 0 profile describing the monitor.
pub fn build_profile_event(profile: &ProfileConfig) -> EventBuilder {
    let mut metadata = Metadata::new().name(&profile.name);
    if let Some(ref about) = profile.about {
        metadata = metadata.about(about);
    }
    if let Some(url) = profile.picture.as_deref().and_then(|p| Url::parse(p).ok()) {
        metadata = metadata.picture(url);
    }
    EventBuilder::metadata(&metadata)
}

/// Kind 10166 announcement: check frequency, published kinds, and one
/// `c` tag per enabled check.
pub fn build_announcement_event(
    selection: &Nip66Selection,
    frequency_secs: u64,
    timeout_ms: u64,
) -> EventBuilder {
    let mut event_tags: Vec<Tag> = vec![
        Tag::custom(
            TagKind::custom("frequency"),
            [frequency_secs.to_string()],
        ),
        Tag::custom(TagKind::custom("k"), [KIND_RELAY_DISCOVERY.to_string()]),
        Tag::custom(
            TagKind::custom("timeout"),
            [timeout_ms.to_string(), "open".to_string()],
        ),
    ];
    for check in selection.enabled_checks() {
        event_tags.push(Tag::custom(TagKind::custom("c"), [check.to_string()]));
    }
    EventBuilder::new(Kind::from(KIND_MONITOR_ANNOUNCEMENT), "").tags(event_tags)
}

/// Kind 30166 discovery event for one checked relay.
///
/// Content is the relay's NIP-11 document (empty when the fetch
/// failed); tags describe everything the checks observed.
pub fn build_discovery_event(
    relay: &Relay,
    nip11: Option<&Nip11Document>,
    nip66: Option<&Nip66>,
) -> EventBuilder {
    let mut event_tags = tags::identity_tags(relay);

    let content = match nip11 {
        Some(doc) if doc.logs.success => {
            let info = &doc.data;
            event_tags.extend(tags::nip_tags(info));
            event_tags.extend(tags::language_tags(info));
            event_tags.extend(tags::requirement_tags(info));
            event_tags.extend(tags::type_tags(info));
            info.to_json().to_string()
        }
        _ => String::new(),
    };

    if let Some(nip66) = nip66 {
        if let Some(ref rtt) = nip66.rtt {
            event_tags.extend(tags::rtt_tags(&rtt.data));
        }
        if let Some(ref geo) = nip66.geo {
            event_tags.extend(tags::geo_tags(&geo.data));
        }
        if let Some(ref net) = nip66.net {
            event_tags.extend(tags::asn_tags(&net.data));
        }
    }

    EventBuilder::new(Kind::from(KIND_RELAY_DISCOVERY), content).tags(event_tags)
}

/// Parse the configured publish targets, dropping invalid URLs.
pub fn publish_relays(config: &PublishingConfig) -> Vec<Relay> {
    config
        .relays
        .iter()
        .filter_map(|url| match Relay::parse(url) {
            Ok(relay) => Some(relay),
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::services::monitor",
                    "publish_relay_invalid url={url:?} error={e}"
                );
                None
            }
        })
        .collect()
}
