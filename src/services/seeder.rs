use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::db::Store;
use crate::error::{ConfigError, Result};
use crate::models::{Candidate, Relay, ServiceName, now_ts};
use crate::services::{CycleStats, Service};

/// Seeder settings (`seeder.yaml`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeederConfig {
    /// Newline-delimited file of relay URLs; `#` comments and blank
    /// lines are skipped.
    pub seed_file: PathBuf,
}

impl Default for SeederConfig {
    fn default() -> Self {
        Self {
            seed_file: PathBuf::from("seed_relays.txt"),
        }
    }
}

impl SeederConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.seed_file.as_os_str().is_empty() {
            return Err(ConfigError::invalid("seeder.seed_file", "must not be empty"));
        }
        Ok(())
    }
}

/// One-shot ingestion of seed relay URLs into the candidate set.
pub struct Seeder {
    config: SeederConfig,
    store: Arc<Store>,
}

impl Seeder {
    pub fn new(config: SeederConfig, store: Arc<Store>) -> Self {
        Self { config, store }
    }

    /// Parse seed file contents into deduplicated candidates.
    ///
    /// Invalid lines are logged and counted as skipped, never fatal.
    fn parse_seeds(content: &str) -> (Vec<Candidate>, u64) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();
        let mut skipped = 0u64;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Relay::parse(line) {
                Ok(relay) => {
                    if seen.insert(relay.url().to_string()) {
                        candidates.push(Candidate::new(relay));
                    }
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        target: "bigbrotr::services::seeder",
                        "seed_invalid line={line:?} error={e}"
                    );
                }
            }
        }
        (candidates, skipped)
    }
}

#[async_trait]
impl Service for Seeder {
    fn name(&self) -> ServiceName {
        ServiceName::Seeder
    }

    fn one_shot(&self) -> bool {
        true
    }

    async fn run(&mut self) -> Result<CycleStats> {
        let content = tokio::fs::read_to_string(&self.config.seed_file).await?;
        let (candidates, skipped) = Self::parse_seeds(&content);

        let now = now_ts();
        let mut states = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            states.push(candidate.to_state(ServiceName::Validator, now)?);
        }

        let mut succeeded = 0u64;
        for chunk in states.chunks(self.store.max_batch_size()) {
            succeeded += self.store.upsert_service_state(chunk).await?;
        }

        tracing::info!(
            target: "bigbrotr::services::seeder",
            "seeded candidates={} skipped={skipped} file={}",
            succeeded,
            self.config.seed_file.display()
        );

        Ok(CycleStats {
            succeeded,
            failed: 0,
            skipped,
        })
    }
}
