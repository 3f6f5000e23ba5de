use crate::error::ProtocolError;
use crate::models::event::Event;
use crate::models::relay::Relay;

/// Observation of an event held by a relay at a point in time.
///
/// Created when the synchronizer sees the event on the relay; never
/// updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRelay {
    pub event: Event,
    pub relay: Relay,
    pub seen_at: i64,
}

impl EventRelay {
    pub fn new(event: Event, relay: Relay, seen_at: i64) -> Result<Self, ProtocolError> {
        if seen_at < 0 {
            return Err(ProtocolError::InvalidEvent(format!(
                "seen_at must be non-negative, got {seen_at}"
            )));
        }
        Ok(Self {
            event,
            relay,
            seen_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::{EventBuilder, Keys};

    fn sample_event() -> Event {
        let keys = Keys::generate();
        let wire = EventBuilder::text_note("seen somewhere")
            .sign_with_keys(&keys)
            .unwrap();
        Event::from_nostr(&wire).unwrap()
    }

    #[test]
    fn constructs_with_valid_timestamp() {
        let relay = Relay::parse("wss://relay.damus.io").unwrap();
        let er = EventRelay::new(sample_event(), relay.clone(), 1_700_000_000).unwrap();
        assert_eq!(er.relay, relay);
        assert_eq!(er.seen_at, 1_700_000_000);
    }

    #[test]
    fn rejects_negative_seen_at() {
        let relay = Relay::parse("wss://relay.damus.io").unwrap();
        assert!(EventRelay::new(sample_event(), relay, -5).is_err());
    }
}
