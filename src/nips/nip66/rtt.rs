use std::time::{Duration, Instant};

use nostr_sdk::prelude::*;
use serde::Serialize;
use serde_json::{Value, json};

use crate::models::Relay;
use crate::transport::connect_relay;

/// Round-trip times in milliseconds, one per phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Nip66RttData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_open: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_read: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_write: Option<i64>,
}

/// Multi-phase RTT log.
///
/// Unlike the single-outcome probe logs, each phase carries its own
/// success flag. The phases cascade: when open fails, read and write are
/// recorded as failed without being attempted (`None` marks a phase that
/// was skipped for another reason). Per phase, a success never carries a
/// reason and a failure always does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Nip66RttLogs {
    pub open_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_reason: Option<String>,
}

/// RTT probe result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nip66RttMetadata {
    pub data: Nip66RttData,
    pub logs: Nip66RttLogs,
}

impl Nip66RttMetadata {
    pub fn to_payload(&self) -> Value {
        json!({
            "data": serde_json::to_value(&self.data).unwrap_or(Value::Null),
            "logs": serde_json::to_value(&self.logs).unwrap_or(Value::Null),
        })
    }

    fn open_failed(reason: String) -> Self {
        Self {
            data: Nip66RttData::default(),
            logs: Nip66RttLogs {
                open_success: false,
                open_reason: Some(reason),
                // Cascade: nothing downstream can run without a socket.
                read_success: Some(false),
                write_success: Some(false),
                ..Nip66RttLogs::default()
            },
        }
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

/// Probe a relay's open, read, and write round-trip times.
///
/// Write includes a verification step: after the relay acknowledges the
/// event, a subscription for its id must return it within the timeout;
/// a relay that accepts but does not serve the event is recorded as
/// `unverified: accepted but not retrievable`.
pub async fn run_rtt(
    relay: &Relay,
    keys: &Keys,
    event_builder: &EventBuilder,
    read_filter: &Filter,
    proxy_url: Option<&str>,
    timeout: Duration,
    allow_insecure: bool,
) -> Nip66RttMetadata {
    let mut data = Nip66RttData::default();
    let mut logs = Nip66RttLogs::default();

    let start = Instant::now();
    let client =
        match connect_relay(relay, Some(keys), proxy_url, timeout, allow_insecure).await {
            Ok(client) => client,
            Err(e) => return Nip66RttMetadata::open_failed(e.to_string()),
        };
    data.rtt_open = Some(elapsed_ms(start));
    logs.open_success = true;

    // Read phase
    let start = Instant::now();
    match client.fetch_events(read_filter.clone(), timeout).await {
        Ok(_) => {
            data.rtt_read = Some(elapsed_ms(start));
            logs.read_success = Some(true);
        }
        Err(e) => {
            logs.read_success = Some(false);
            logs.read_reason = Some(e.to_string());
        }
    }

    // Write phase, attempted independently of the read outcome
    let start = Instant::now();
    match client.send_event_builder(event_builder.clone()).await {
        Ok(output) => {
            let event_id: EventId = *output;
            data.rtt_write = Some(elapsed_ms(start));

            // Verification: the accepted event must be retrievable.
            let verify_filter = Filter::new().id(event_id).limit(1);
            match client.fetch_events(verify_filter, timeout).await {
                Ok(events) if !events.is_empty() => {
                    logs.write_success = Some(true);
                }
                Ok(_) => {
                    data.rtt_write = None;
                    logs.write_success = Some(false);
                    logs.write_reason =
                        Some("unverified: accepted but not retrievable".to_string());
                }
                Err(e) => {
                    data.rtt_write = None;
                    logs.write_success = Some(false);
                    logs.write_reason = Some(format!("verification failed: {e}"));
                }
            }
        }
        Err(e) => {
            logs.write_success = Some(false);
            logs.write_reason = Some(e.to_string());
        }
    }

    client.disconnect().await;
    Nip66RttMetadata { data, logs }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_failure_cascades() {
        let result = Nip66RttMetadata::open_failed("connection refused".to_string());
        assert!(!result.logs.open_success);
        assert!(result.logs.open_reason.is_some());
        assert_eq!(result.logs.read_success, Some(false));
        assert_eq!(result.logs.write_success, Some(false));
        assert_eq!(result.data.rtt_open, None);
        assert_eq!(result.data.rtt_read, None);
        assert_eq!(result.data.rtt_write, None);
    }

    #[test]
    fn payload_prunes_untouched_phases() {
        let result = Nip66RttMetadata {
            data: Nip66RttData {
                rtt_open: Some(120),
                rtt_read: Some(80),
                rtt_write: None,
            },
            logs: Nip66RttLogs {
                open_success: true,
                read_success: Some(true),
                write_success: Some(false),
                write_reason: Some("blocked: pow required".to_string()),
                ..Nip66RttLogs::default()
            },
        };
        let payload = result.to_payload();
        assert_eq!(payload["data"]["rtt_open"], 120);
        assert!(payload["data"].get("rtt_write").is_none());
        assert_eq!(payload["logs"]["open_success"], true);
        assert!(payload["logs"].get("open_reason").is_none());
        assert_eq!(payload["logs"]["write_success"], false);
    }

    // Drives a real relay; requires network access.
    #[tokio::test]
    #[ignore = "requires network"]
    async fn rtt_against_live_relay() {
        let relay = Relay::parse("wss://relay.damus.io").unwrap();
        let keys = Keys::generate();
        let builder = EventBuilder::text_note("bigbrotr rtt probe");
        let filter = Filter::new().kind(Kind::TextNote).limit(1);

        let result = run_rtt(
            &relay,
            &keys,
            &builder,
            &filter,
            None,
            Duration::from_secs(10),
            true,
        )
        .await;
        assert!(result.logs.open_success);
        assert!(result.data.rtt_open.unwrap() >= 0);
    }
}
