pub mod event;
pub mod event_relay;
pub mod metadata;
pub mod relay;
pub mod relay_metadata;
pub mod service_state;

pub use event::Event;
pub use event_relay::EventRelay;
pub use metadata::{Metadata, MetadataType};
pub use relay::{NetworkType, Relay, RelayScheme};
pub use relay_metadata::RelayMetadata;
pub use service_state::{Candidate, EventRelayCursor, ServiceName, ServiceState, StateType};

/// Current unix timestamp in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
