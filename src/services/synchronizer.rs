use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use ::rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::task::JoinSet;

use crate::config::NetworksConfig;
use crate::db::Store;
use crate::error::{ConfigError, Result};
use crate::models::{
    Event, EventRelay, EventRelayCursor, Relay, ServiceName, StateType, now_ts,
};
use crate::services::{CycleStats, NetworkSemaphores, Service};
use crate::transport;

/// Subscription filter applied to every synchronized relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    pub kinds: Option<Vec<u16>>,
    pub authors: Option<Vec<String>>,
    pub ids: Option<Vec<String>>,
    /// Earliest `created_at` scanned when a relay has no cursor yet.
    pub since_floor: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

impl FilterConfig {
    /// Build the nostr filter for one relay, starting at its cursor.
    fn build(&self, since: Option<i64>) -> Filter {
        let mut filter = Filter::new();
        if let Some(ref kinds) = self.kinds {
            filter = filter.kinds(kinds.iter().map(|k| Kind::from(*k)));
        }
        if let Some(ref authors) = self.authors {
            let keys: Vec<PublicKey> = authors
                .iter()
                .filter_map(|a| PublicKey::from_hex(a).ok())
                .collect();
            if !keys.is_empty() {
                filter = filter.authors(keys);
            }
        }
        if let Some(ref ids) = self.ids {
            let ids: Vec<EventId> = ids.iter().filter_map(|i| EventId::from_hex(i).ok()).collect();
            if !ids.is_empty() {
                filter = filter.ids(ids);
            }
        }
        if let Some(since) = since.or(self.since_floor) {
            filter = filter.since(Timestamp::from_secs(since.max(0) as u64));
        }
        if let Some(until) = self.until {
            filter = filter.until(Timestamp::from_secs(until.max(0) as u64));
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }
}

/// Per-relay overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayOverride {
    pub enabled: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub proxy_url: Option<String>,
}

/// Synchronizer settings (`synchronizer.yaml`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SynchronizerConfig {
    /// Relays scanned per cycle.
    pub relay_limit: i64,
    /// Events per persisted batch; 0 falls back to the store's
    /// `max_batch_size`.
    pub event_batch_size: usize,
    pub allow_insecure: bool,
    pub filter: FilterConfig,
    pub networks: NetworksConfig,
    /// Keyed by normalized relay URL.
    pub overrides: HashMap<String, RelayOverride>,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            relay_limit: 1_000,
            event_batch_size: 0,
            allow_insecure: true,
            filter: FilterConfig::default(),
            networks: NetworksConfig::default(),
            overrides: HashMap::new(),
        }
    }
}

impl SynchronizerConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.relay_limit <= 0 {
            return Err(ConfigError::invalid("synchronizer.relay_limit", "must be >= 1"));
        }
        if let Some(kinds) = &self.filter.kinds {
            if kinds.is_empty() {
                return Err(ConfigError::invalid(
                    "synchronizer.filter.kinds",
                    "must not be an empty list",
                ));
            }
        }
        self.networks.validate()
    }
}

struct RelayOutcome {
    relay_url: String,
    stored: u64,
    error: Option<String>,
}

/// Per-relay event scan with persisted cursors and at-least-once
/// delivery.
///
/// Each relay's events are verified, batched, and flushed through the
/// cascading event-relay insert; the cursor advances to the newest
/// persisted event only after its batch commits, so a crash re-delivers
/// rather than loses. Duplicates are idempotent at the store.
pub struct Synchronizer {
    config: SynchronizerConfig,
    store: Arc<Store>,
}

impl Synchronizer {
    pub fn new(config: SynchronizerConfig, store: Arc<Store>) -> Self {
        Self { config, store }
    }

    /// Advance point for a persisted chunk: greatest `(created_at, id)`.
    fn chunk_cursor(chunk: &[EventRelay]) -> Option<(i64, EventId)> {
        chunk
            .iter()
            .map(|er| (er.event.created_at(), er.event.id()))
            .max()
    }

    async fn sync_relay(
        store: Arc<Store>,
        config: Arc<SynchronizerConfig>,
        relay: Relay,
        cursor: Option<EventRelayCursor>,
        batch_size: usize,
    ) -> RelayOutcome {
        let url = relay.url().to_string();
        let network = relay.network();
        let settings = config.networks.get(network);
        let overrides = config.overrides.get(&url);

        let timeout = overrides
            .and_then(|o| o.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| settings.timeout());
        let proxy_url = overrides
            .and_then(|o| o.proxy_url.as_deref())
            .or_else(|| config.networks.proxy_url(network));

        let since = cursor.as_ref().and_then(|c| c.seen_at);
        let filter = config.filter.build(since);

        let events = match transport::fetch_relay_events(
            &relay,
            filter,
            None,
            proxy_url,
            timeout,
            config.allow_insecure,
        )
        .await
        {
            Ok(events) => events,
            Err(e) => {
                return RelayOutcome {
                    relay_url: url,
                    stored: 0,
                    error: Some(e.to_string()),
                };
            }
        };

        // Oldest first, so each flushed chunk moves the cursor forward.
        let mut events: Vec<Event> = events;
        events.sort_by_key(|e| (e.created_at(), e.id()));

        let seen_at = now_ts();
        let mut batch: Vec<EventRelay> = Vec::with_capacity(events.len().min(batch_size));
        for event in events {
            match EventRelay::new(event, relay.clone(), seen_at) {
                Ok(er) => batch.push(er),
                Err(e) => {
                    tracing::debug!(
                        target: "bigbrotr::services::synchronizer",
                        "event_rejected relay={url} error={e}"
                    );
                }
            }
        }

        let mut stored = 0u64;
        for chunk in batch.chunks(batch_size) {
            match store.insert_event_relays(chunk).await {
                Ok(count) => {
                    stored += count;
                    // Cursor moves only after the batch persisted.
                    if let Some((seen_at, event_id)) = Self::chunk_cursor(chunk) {
                        let cursor =
                            EventRelayCursor::new(&url, Some(seen_at), Some(event_id))
                                .and_then(|c| c.to_state(now_ts()));
                        match cursor {
                            Ok(state) => {
                                if let Err(e) = store.upsert_service_state(&[state]).await {
                                    return RelayOutcome {
                                        relay_url: url,
                                        stored,
                                        error: Some(format!("cursor update failed: {e}")),
                                    };
                                }
                            }
                            Err(e) => {
                                return RelayOutcome {
                                    relay_url: url,
                                    stored,
                                    error: Some(format!("cursor build failed: {e}")),
                                };
                            }
                        }
                    }
                }
                Err(e) => {
                    // The cursor stays put: these events re-deliver next
                    // cycle.
                    return RelayOutcome {
                        relay_url: url,
                        stored,
                        error: Some(format!("batch insert failed: {e}")),
                    };
                }
            }
        }

        RelayOutcome {
            relay_url: url,
            stored,
            error: None,
        }
    }
}

#[async_trait]
impl Service for Synchronizer {
    fn name(&self) -> ServiceName {
        ServiceName::Synchronizer
    }

    async fn run(&mut self) -> Result<CycleStats> {
        let mut relays = self
            .store
            .fetch_relays(None, self.config.relay_limit)
            .await?;
        if relays.is_empty() {
            return Ok(CycleStats::default());
        }
        // No cross-relay ordering is promised; shuffling keeps one slow
        // relay from always consuming the first permits of a cycle.
        relays.shuffle(&mut ::rand::rng());

        let cursor_rows = self
            .store
            .get_service_state(ServiceName::Synchronizer, StateType::Cursor, None)
            .await?;
        let mut cursors: HashMap<String, EventRelayCursor> = HashMap::new();
        for state in &cursor_rows {
            match EventRelayCursor::from_state(state) {
                Ok(cursor) => {
                    cursors.insert(state.state_key.clone(), cursor);
                }
                Err(e) => {
                    tracing::warn!(
                        target: "bigbrotr::services::synchronizer",
                        "cursor_parse_failed key={} error={e}",
                        state.state_key
                    );
                }
            }
        }

        let batch_size = match self.config.event_batch_size {
            0 => self.store.max_batch_size(),
            n => n.min(self.store.max_batch_size()),
        };
        let semaphores = NetworkSemaphores::from_config(&self.config.networks);
        let config = Arc::new(self.config.clone());

        let mut tasks: JoinSet<RelayOutcome> = JoinSet::new();
        let mut skipped = 0u64;

        for relay in relays {
            let network = relay.network();
            let enabled = config
                .overrides
                .get(relay.url())
                .and_then(|o| o.enabled)
                .unwrap_or_else(|| self.config.networks.is_enabled(network));
            if !enabled {
                skipped += 1;
                continue;
            }

            let semaphore = semaphores.get(network);
            let store = Arc::clone(&self.store);
            let config = Arc::clone(&config);
            let cursor = cursors.remove(relay.url());
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                Self::sync_relay(store, config, relay, cursor, batch_size).await
            });
        }

        // Structured collection: one relay failing never cancels others.
        let mut stats = CycleStats {
            skipped,
            ..CycleStats::default()
        };
        let mut events_stored = 0u64;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    events_stored += outcome.stored;
                    match outcome.error {
                        None => stats.succeeded += 1,
                        Some(reason) => {
                            stats.failed += 1;
                            tracing::warn!(
                                target: "bigbrotr::services::synchronizer",
                                "relay_sync_failed relay={} stored={} error={reason}",
                                outcome.relay_url,
                                outcome.stored
                            );
                        }
                    }
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::error!(
                        target: "bigbrotr::services::synchronizer",
                        "sync_task_panicked error={e}"
                    );
                }
            }
        }

        crate::metrics::inc_counter("events_stored", events_stored);
        tracing::info!(
            target: "bigbrotr::services::synchronizer",
            "sync_cycle events_stored={events_stored} relays_ok={} relays_failed={}",
            stats.succeeded,
            stats.failed
        );
        Ok(stats)
    }
}
