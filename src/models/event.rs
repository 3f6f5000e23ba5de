use nostr_sdk::prelude::*;

use crate::error::ProtocolError;

/// A validated NIP-01 Nostr event.
///
/// Constructed only from a signature-verified `nostr_sdk` event: the id
/// must match the hash of the canonical serialization and the signature
/// must verify against it under the pubkey. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    id: EventId,
    pubkey: PublicKey,
    created_at: i64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    sig: Signature,
}

impl Event {
    /// Validate a wire event and take ownership of its fields.
    ///
    /// Fails when the id or signature does not verify.
    pub fn from_nostr(event: &nostr_sdk::Event) -> Result<Self, ProtocolError> {
        event
            .verify()
            .map_err(|e| ProtocolError::InvalidEvent(format!("{}: {e}", event.id)))?;

        Ok(Self {
            id: event.id,
            pubkey: event.pubkey,
            created_at: event.created_at.as_u64() as i64,
            kind: event.kind.as_u16(),
            tags: event
                .tags
                .iter()
                .map(|tag| tag.as_slice().to_vec())
                .collect(),
            content: event.content.clone(),
            sig: event.sig,
        })
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn id_hex(&self) -> String {
        self.id.to_hex()
    }

    pub fn pubkey_hex(&self) -> String {
        self.pubkey.to_hex()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn kind(&self) -> u16 {
        self.kind
    }

    pub fn tags(&self) -> &[Vec<String>] {
        &self.tags
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sig_hex(&self) -> String {
        self.sig.to_string()
    }

    /// Tags serialized as a JSON array-of-arrays for JSONB storage.
    pub fn tags_json(&self) -> serde_json::Value {
        serde_json::json!(self.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_event() -> nostr_sdk::Event {
        let keys = Keys::generate();
        EventBuilder::text_note("bigbrotr test note")
            .sign_with_keys(&keys)
            .unwrap()
    }

    #[test]
    fn accepts_signed_event() {
        let wire = signed_event();
        let event = Event::from_nostr(&wire).unwrap();
        assert_eq!(event.id(), wire.id);
        assert_eq!(event.kind(), 1);
        assert_eq!(event.content(), "bigbrotr test note");
        assert_eq!(event.created_at(), wire.created_at.as_u64() as i64);
    }

    #[test]
    fn rejects_tampered_event() {
        let wire = signed_event();
        let mut json = serde_json::to_value(&wire).unwrap();
        json["content"] = serde_json::json!("tampered");
        let tampered: nostr_sdk::Event = serde_json::from_value(json).unwrap();
        assert!(Event::from_nostr(&tampered).is_err());
    }

    #[test]
    fn preserves_tag_order() {
        let keys = Keys::generate();
        let wire = EventBuilder::text_note("tagged")
            .tags([
                Tag::custom(TagKind::custom("r"), ["wss://one.example.com"]),
                Tag::custom(TagKind::custom("r"), ["wss://two.example.com"]),
            ])
            .sign_with_keys(&keys)
            .unwrap();
        let event = Event::from_nostr(&wire).unwrap();
        assert_eq!(event.tags()[0][1], "wss://one.example.com");
        assert_eq!(event.tags()[1][1], "wss://two.example.com");
    }
}
