use crate::error::ProtocolError;
use crate::models::metadata::Metadata;
use crate::models::relay::Relay;

/// A metadata observation for a relay at a point in time.
///
/// The metadata itself is content-addressed, so repeated observations of
/// identical payloads share storage while `generated_at` preserves the
/// time series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMetadata {
    pub relay: Relay,
    pub metadata: Metadata,
    pub generated_at: i64,
}

impl RelayMetadata {
    pub fn new(relay: Relay, metadata: Metadata, generated_at: i64) -> Result<Self, ProtocolError> {
        if generated_at < 0 {
            return Err(ProtocolError::InvalidMetadata(format!(
                "generated_at must be non-negative, got {generated_at}"
            )));
        }
        Ok(Self {
            relay,
            metadata,
            generated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::MetadataType;
    use serde_json::json;

    #[test]
    fn equal_payloads_share_content_hash() {
        let relay_a = Relay::parse("wss://a.example.com").unwrap();
        let relay_b = Relay::parse("wss://b.example.com").unwrap();
        let meta = Metadata::new(MetadataType::Nip66Rtt, json!({"rtt_open": 42})).unwrap();

        let a = RelayMetadata::new(relay_a, meta.clone(), 100).unwrap();
        let b = RelayMetadata::new(relay_b, meta, 200).unwrap();
        assert_eq!(a.metadata.content_hash(), b.metadata.content_hash());
        assert_ne!(a.generated_at, b.generated_at);
    }

    #[test]
    fn rejects_negative_generated_at() {
        let relay = Relay::parse("wss://a.example.com").unwrap();
        let meta = Metadata::new(MetadataType::Nip66Rtt, json!({})).unwrap();
        assert!(RelayMetadata::new(relay, meta, -1).is_err());
    }
}
