use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use serde_json::{Value, json};
use tokio::task::JoinSet;

use crate::config::{ENV_PRIVATE_KEY, load_keys_from_env};
use crate::db::Store;
use crate::error::{BigBrotrError, Result};
use crate::models::{
    Relay, RelayMetadata, ServiceName, ServiceState, StateType, now_ts,
};
use crate::nips::nip11::{NIP11_MAX_BODY_SIZE, Nip11Document, fetch_nip11};
use crate::nips::nip66::{self, GeoReader, Nip66, Nip66Dependencies};
use crate::services::{CycleStats, NetworkSemaphores, Service};
use crate::transport;

pub mod config;
pub mod publish;
pub mod tags;

pub use config::MonitorConfig;

struct CheckResult {
    relay: Relay,
    records: Vec<RelayMetadata>,
    nip11: Option<Nip11Document>,
    nip66: Option<Nip66>,
    ok: bool,
}

/// Periodic NIP-11 + NIP-66 checks on known relays, with optional
/// publishing of the results as Nostr discovery events.
pub struct Monitor {
    config: MonitorConfig,
    store: Arc<Store>,
    keys: Option<Keys>,
    city_reader: Option<GeoReader>,
    asn_reader: Option<GeoReader>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, store: Arc<Store>) -> Self {
        Self {
            config,
            store,
            keys: None,
            city_reader: None,
            asn_reader: None,
        }
    }

    fn dependencies(&self) -> Nip66Dependencies {
        Nip66Dependencies {
            keys: self.keys.clone(),
            event_builder: self
                .keys
                .is_some()
                .then(|| EventBuilder::text_note("bigbrotr monitor probe")),
            read_filter: Some(Filter::new().kind(Kind::TextNote).limit(1)),
            city_reader: self.city_reader.clone(),
            asn_reader: self.asn_reader.clone(),
        }
    }

    /// Previous failure counters from the last-check cursors.
    async fn load_failure_counts(&self) -> Result<HashMap<String, u64>> {
        let rows = self
            .store
            .get_service_state(ServiceName::Monitor, StateType::Cursor, None)
            .await?;
        Ok(rows
            .into_iter()
            .map(|state| {
                let failures = state
                    .state_value
                    .get("failures")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                (state.state_key, failures)
            })
            .collect())
    }

    async fn check_relay(
        relay: Relay,
        config: &MonitorConfig,
        deps: Nip66Dependencies,
    ) -> CheckResult {
        let network = relay.network();
        let settings = config.networks.get(network);
        let proxy_url = config.networks.proxy_url(network);
        let timeout = settings.timeout();

        // Declared order: NIP-11 fetch, then the NIP-66 probe.
        let nip11 = if config.nip11_enabled {
            Some(
                fetch_nip11(
                    &relay,
                    proxy_url,
                    timeout,
                    NIP11_MAX_BODY_SIZE,
                    config.allow_insecure,
                )
                .await,
            )
        } else {
            None
        };

        let nip66 = nip66::probe(
            &relay,
            &config.checks,
            &deps,
            proxy_url,
            timeout,
            config.allow_insecure,
        )
        .await;

        let mut records = Vec::new();
        let mut ok = nip66.any_success();
        if let Some(ref doc) = nip11 {
            ok = ok || doc.logs.success;
            match doc.to_relay_metadata() {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        target: "bigbrotr::services::monitor",
                        "nip11_metadata_failed relay={} error={e}",
                        relay.url()
                    );
                }
            }
        }
        match nip66.to_relay_metadata(&relay) {
            Ok(mut nip66_records) => records.append(&mut nip66_records),
            Err(e) => {
                tracing::warn!(
                    target: "bigbrotr::services::monitor",
                    "nip66_metadata_failed relay={} error={e}",
                    relay.url()
                );
            }
        }

        CheckResult {
            relay,
            records,
            nip11,
            nip66: Some(nip66),
            ok,
        }
    }

    async fn persist_results(
        &self,
        results: &[CheckResult],
        failures: &HashMap<String, u64>,
    ) -> Result<()> {
        let records: Vec<RelayMetadata> = results
            .iter()
            .flat_map(|r| r.records.iter().cloned())
            .collect();
        for chunk in records.chunks(self.store.max_batch_size()) {
            self.store.insert_relay_metadata(chunk, true).await?;
        }

        let now = now_ts();
        let mut cursors = Vec::with_capacity(results.len());
        for result in results {
            let previous = failures.get(result.relay.url()).copied().unwrap_or(0);
            let count = if result.ok { 0 } else { previous + 1 };
            cursors.push(ServiceState::new(
                ServiceName::Monitor,
                StateType::Cursor,
                result.relay.url(),
                json!({ "checked_at": now, "failures": count }),
                now,
            )?);
        }
        for chunk in cursors.chunks(self.store.max_batch_size()) {
            self.store.upsert_service_state(chunk).await?;
        }
        Ok(())
    }

    async fn publish_results(&self, results: &[CheckResult], interval_secs: u64) {
        let publishing = &self.config.publishing;
        if !publishing.enabled {
            return;
        }
        let Some(keys) = self.keys.as_ref() else {
            tracing::warn!(
                target: "bigbrotr::services::monitor",
                "publishing_skipped reason=no_keys"
            );
            return;
        };

        let targets = publish::publish_relays(publishing);
        if targets.is_empty() {
            return;
        }

        let mut builders: Vec<EventBuilder> = Vec::new();
        if publishing.publish_profile {
            builders.push(publish::build_profile_event(&publishing.profile));
        }
        if publishing.publish_announcement {
            let timeout_ms = self.config.networks.clearnet.timeout_secs * 1000;
            builders.push(publish::build_announcement_event(
                &self.config.checks,
                interval_secs,
                timeout_ms,
            ));
        }
        if publishing.publish_discovery {
            for result in results {
                builders.push(publish::build_discovery_event(
                    &result.relay,
                    result.nip11.as_ref(),
                    result.nip66.as_ref(),
                ));
            }
        }

        let sent = transport::broadcast_events(
            &builders,
            &targets,
            keys,
            Duration::from_secs(publishing.timeout_secs),
            self.config.allow_insecure,
        )
        .await;
        crate::metrics::inc_counter("discovery_events_published", builders.len() as u64);
        tracing::info!(
            target: "bigbrotr::services::monitor",
            "published events={} relays_ok={sent}/{}",
            builders.len(),
            targets.len()
        );
    }
}

#[async_trait]
impl Service for Monitor {
    fn name(&self) -> ServiceName {
        ServiceName::Monitor
    }

    async fn on_start(&mut self) -> Result<()> {
        if self.config.publishing.enabled {
            self.keys = Some(load_keys_from_env(ENV_PRIVATE_KEY)?);
        } else if let Ok(keys) = load_keys_from_env(ENV_PRIVATE_KEY) {
            // Optional without publishing: enables the RTT write phase.
            self.keys = Some(keys);
        }

        if let Some(path) = self.config.geoip.city_db.as_ref() {
            let reader = maxminddb::Reader::open_readfile(path)
                .map_err(|e| BigBrotrError::Other(anyhow::anyhow!("city db {path:?}: {e}")))?;
            self.city_reader = Some(Arc::new(reader));
        }
        if let Some(path) = self.config.geoip.asn_db.as_ref() {
            let reader = maxminddb::Reader::open_readfile(path)
                .map_err(|e| BigBrotrError::Other(anyhow::anyhow!("asn db {path:?}: {e}")))?;
            self.asn_reader = Some(Arc::new(reader));
        }
        Ok(())
    }

    async fn run(&mut self) -> Result<CycleStats> {
        let now = now_ts();
        let due = self
            .store
            .fetch_relays_due_for_check(now - self.config.staleness_secs, self.config.chunk_size)
            .await?;
        if due.is_empty() {
            return Ok(CycleStats::default());
        }
        crate::metrics::set_gauge("relays_due_for_check", due.len() as f64);

        let failures = self.load_failure_counts().await?;
        let semaphores = NetworkSemaphores::from_config(&self.config.networks);
        let config = Arc::new(self.config.clone());

        let mut tasks: JoinSet<CheckResult> = JoinSet::new();
        let mut skipped = 0u64;

        for relay in due {
            let network = relay.network();
            if !self.config.networks.is_enabled(network) {
                skipped += 1;
                continue;
            }

            let semaphore = semaphores.get(network);
            let config = Arc::clone(&config);
            let deps = self.dependencies();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                Self::check_relay(relay, &config, deps).await
            });
        }

        // One relay's checks failing never cancels the siblings.
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        target: "bigbrotr::services::monitor",
                        "check_task_panicked error={e}"
                    );
                }
            }
        }

        self.persist_results(&results, &failures).await?;
        self.publish_results(&results, self.config.staleness_secs as u64)
            .await;

        let succeeded = results.iter().filter(|r| r.ok).count() as u64;
        let failed = results.len() as u64 - succeeded;
        Ok(CycleStats {
            succeeded,
            failed,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::Pool;

    fn test_monitor(config: MonitorConfig) -> Monitor {
        let store = Arc::new(Store::new(Pool::new(DatabaseConfig::default())));
        Monitor::new(config, store)
    }

    #[test]
    fn dependencies_without_keys_disable_rtt_write() {
        let monitor = test_monitor(MonitorConfig::default());
        let deps = monitor.dependencies();
        assert!(deps.keys.is_none());
        assert!(deps.event_builder.is_none());
        assert!(deps.read_filter.is_some());
    }

    #[test]
    fn dependencies_with_keys_enable_rtt() {
        let mut monitor = test_monitor(MonitorConfig::default());
        monitor.keys = Some(Keys::generate());
        let deps = monitor.dependencies();
        assert!(deps.keys.is_some());
        assert!(deps.event_builder.is_some());
    }

    #[tokio::test]
    async fn on_start_fails_on_missing_geoip_file() {
        let mut config = MonitorConfig::default();
        config.geoip.city_db = Some("/nonexistent/GeoLite2-City.mmdb".into());
        let mut monitor = test_monitor(config);
        assert!(monitor.on_start().await.is_err());
    }
}
