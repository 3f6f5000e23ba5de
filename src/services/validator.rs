use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinSet;

use crate::config::NetworksConfig;
use crate::db::Store;
use crate::error::{ConfigError, ConnectivityError, Result};
use crate::models::{Candidate, Relay, ServiceName, StateType, now_ts};
use crate::services::{CycleStats, NetworkSemaphores, Service};
use crate::transport;

/// Validator settings (`validator.yaml`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorConfig {
    /// Candidates examined per cycle.
    pub chunk_size: i64,
    /// Failed validations before a candidate is discarded.
    pub max_attempts: u32,
    /// Fall back to unverified TLS when a candidate's certificate fails.
    pub allow_insecure: bool,
    pub networks: NetworksConfig,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            max_attempts: 5,
            allow_insecure: true,
            networks: NetworksConfig::default(),
        }
    }
}

impl ValidatorConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.chunk_size <= 0 {
            return Err(ConfigError::invalid("validator.chunk_size", "must be >= 1"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("validator.max_attempts", "must be >= 1"));
        }
        self.networks.validate()
    }
}

enum Verdict {
    Valid,
    Invalid,
    /// Overlay candidate with no proxy configured; counted as a failed
    /// attempt without any network I/O.
    Misconfigured,
}

/// Promotes candidates to relays via a Nostr protocol handshake.
///
/// Candidates are taken least-failed and oldest first (random tiebreak),
/// probed concurrently inside per-network budgets, then either promoted
/// into the relay table, re-queued with an incremented failure count, or
/// discarded once `max_attempts` is reached.
pub struct Validator {
    config: ValidatorConfig,
    store: Arc<Store>,
}

impl Validator {
    pub fn new(config: ValidatorConfig, store: Arc<Store>) -> Self {
        Self { config, store }
    }

    async fn probe_candidate(
        candidate: &Candidate,
        networks: &NetworksConfig,
        allow_insecure: bool,
    ) -> Verdict {
        let network = candidate.network();
        let settings = networks.get(network);
        let proxy_url = networks.proxy_url(network);

        if network.is_overlay() && proxy_url.is_none() {
            tracing::warn!(
                target: "bigbrotr::services::validator",
                "candidate_misconfigured url={} network={network} reason=no_proxy",
                candidate.relay.url()
            );
            return Verdict::Misconfigured;
        }

        match transport::is_nostr_relay(
            &candidate.relay,
            proxy_url,
            settings.timeout(),
            None,
            allow_insecure,
        )
        .await
        {
            Ok(true) => Verdict::Valid,
            Ok(false) => Verdict::Invalid,
            Err(ConnectivityError::ProxyRequired { .. }) => Verdict::Misconfigured,
            Err(_) => Verdict::Invalid,
        }
    }

    async fn apply_results(
        &self,
        results: Vec<(Candidate, Verdict)>,
    ) -> Result<CycleStats> {
        let mut stats = CycleStats::default();
        let mut promoted: Vec<Relay> = Vec::new();
        let mut deletions: Vec<String> = Vec::new();
        let mut retries: Vec<Candidate> = Vec::new();

        for (mut candidate, verdict) in results {
            match verdict {
                Verdict::Valid => {
                    stats.succeeded += 1;
                    deletions.push(candidate.relay.url().to_string());
                    promoted.push(candidate.relay);
                }
                Verdict::Invalid | Verdict::Misconfigured => {
                    stats.failed += 1;
                    candidate.failures += 1;
                    if candidate.failures >= self.config.max_attempts {
                        tracing::info!(
                            target: "bigbrotr::services::validator",
                            "candidate_discarded url={} failures={}",
                            candidate.relay.url(),
                            candidate.failures
                        );
                        deletions.push(candidate.relay.url().to_string());
                    } else {
                        retries.push(candidate);
                    }
                }
            }
        }

        if !promoted.is_empty() {
            let inserted = self.store.insert_relays(&promoted).await?;
            crate::metrics::inc_counter("relays_promoted", inserted);
        }

        let now = now_ts();
        let mut retry_states = Vec::with_capacity(retries.len());
        for candidate in &retries {
            retry_states.push(candidate.to_state(ServiceName::Validator, now)?);
        }
        for chunk in retry_states.chunks(self.store.max_batch_size()) {
            self.store.upsert_service_state(chunk).await?;
        }

        if !deletions.is_empty() {
            let services = vec![ServiceName::Validator; deletions.len()];
            let types = vec![StateType::Candidate; deletions.len()];
            for ((services, types), keys) in services
                .chunks(self.store.max_batch_size())
                .zip(types.chunks(self.store.max_batch_size()))
                .zip(deletions.chunks(self.store.max_batch_size()))
            {
                self.store
                    .delete_service_state(services, types, keys)
                    .await?;
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl Service for Validator {
    fn name(&self) -> ServiceName {
        ServiceName::Validator
    }

    async fn run(&mut self) -> Result<CycleStats> {
        let candidates = self.store.fetch_candidates(self.config.chunk_size).await?;
        if candidates.is_empty() {
            return Ok(CycleStats::default());
        }

        let semaphores = NetworkSemaphores::from_config(&self.config.networks);
        let networks = Arc::new(self.config.networks.clone());
        let allow_insecure = self.config.allow_insecure;

        let mut tasks: JoinSet<(Candidate, Verdict)> = JoinSet::new();
        let mut skipped = 0u64;

        for candidate in candidates {
            let network = candidate.network();
            if !networks.is_enabled(network) {
                skipped += 1;
                continue;
            }

            let semaphore = semaphores.get(network);
            let networks = Arc::clone(&networks);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let verdict =
                    Self::probe_candidate(&candidate, &networks, allow_insecure).await;
                (candidate, verdict)
            });
        }

        // Collect every task; one candidate failing never cancels its
        // siblings.
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        target: "bigbrotr::services::validator",
                        "candidate_task_panicked error={e}"
                    );
                }
            }
        }

        let mut stats = self.apply_results(results).await?;
        stats.skipped += skipped;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(ValidatorConfig::default().validate().is_ok());

        let config = ValidatorConfig {
            chunk_size: 0,
            ..ValidatorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ValidatorConfig {
            max_attempts: 0,
            ..ValidatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn overlay_candidate_without_proxy_is_misconfigured() {
        // Tor enabled but with no proxy URL: the candidate must be
        // counted as failed without any connection attempt.
        let mut networks = NetworksConfig::default();
        networks.tor.enabled = true;
        networks.tor.proxy_url = None;

        let relay = Relay::parse(
            "ws://oxtrdevav64z64yb7x6rjg4ntzqjhedm5b5zjqulugknhzr46ny2qbad.onion",
        )
        .unwrap();
        let candidate = Candidate::new(relay);

        let verdict = Validator::probe_candidate(&candidate, &networks, false).await;
        assert!(matches!(verdict, Verdict::Misconfigured));
    }
}
