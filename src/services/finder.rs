use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::db::Store;
use crate::error::{ConfigError, Result};
use crate::models::{
    Candidate, Relay, ServiceName, ServiceState, StateType, now_ts,
};
use crate::services::{CycleStats, Service};

/// One external registry serving a JSON list of relay URLs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiSource {
    /// Cursor key for this source.
    pub id: String,
    pub url: String,
    /// JSON pointer to the list inside the response (empty string for a
    /// top-level array).
    #[serde(default)]
    pub json_pointer: String,
    /// When the list contains objects, the key holding the relay URL.
    #[serde(default)]
    pub url_key: Option<String>,
}

/// Finder settings (`finder.yaml`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FinderConfig {
    pub api_sources: Vec<ApiSource>,
    /// Also scan stored events' tags for relay URLs.
    pub scan_events: bool,
    pub event_scan_limit: i64,
    pub http_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            api_sources: Vec::new(),
            scan_events: true,
            event_scan_limit: 5_000,
            http_timeout_secs: 30,
            max_body_bytes: 1 << 20,
        }
    }
}

impl FinderConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for source in &self.api_sources {
            if source.id.is_empty() {
                return Err(ConfigError::invalid("finder.api_sources.id", "must not be empty"));
            }
            if !source.url.starts_with("http://") && !source.url.starts_with("https://") {
                return Err(ConfigError::invalid(
                    format!("finder.api_sources.{}.url", source.id),
                    "must be an http(s) URL",
                ));
            }
        }
        if self.event_scan_limit <= 0 {
            return Err(ConfigError::invalid("finder.event_scan_limit", "must be >= 1"));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::invalid("finder.max_body_bytes", "must be >= 1"));
        }
        Ok(())
    }
}

/// Periodic discovery of relay candidates from external registries and
/// from relay URLs mentioned in stored events' tags.
///
/// Never promotes: discovered URLs enter the candidate set and the
/// validator decides.
pub struct Finder {
    config: FinderConfig,
    store: Arc<Store>,
}

/// Extract relay URL strings from an API response.
///
/// The pointer addresses the list; entries are either strings or
/// objects holding the URL under `url_key`. Anything else is ignored.
fn extract_urls(body: &Value, pointer: &str, url_key: Option<&str>) -> Vec<String> {
    let list = if pointer.is_empty() {
        Some(body)
    } else {
        body.pointer(pointer)
    };
    let Some(items) = list.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match (item, url_key) {
            (Value::String(url), _) => Some(url.clone()),
            (Value::Object(_), Some(key)) => {
                item.get(key).and_then(Value::as_str).map(str::to_string)
            }
            _ => None,
        })
        .collect()
}

impl Finder {
    pub fn new(config: FinderConfig, store: Arc<Store>) -> Self {
        Self { config, store }
    }

    async fn cursor_value(&self, key: &str) -> Result<Option<i64>> {
        let rows = self
            .store
            .get_service_state(ServiceName::Finder, StateType::Cursor, Some(key))
            .await?;
        Ok(rows
            .last()
            .and_then(|s| s.state_value.get("last_synced_at"))
            .and_then(Value::as_i64))
    }

    async fn save_cursor(&self, key: &str, last_synced_at: i64) -> Result<()> {
        let state = ServiceState::new(
            ServiceName::Finder,
            StateType::Cursor,
            key,
            json!({ "last_synced_at": last_synced_at }),
            now_ts(),
        )?;
        self.store.upsert_service_state(&[state]).await?;
        Ok(())
    }

    async fn fetch_api_source(&self, source: &ApiSource) -> Result<Vec<String>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.http_timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("http client: {e}"))?;

        let mut response = client
            .get(&source.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("fetch {}: {e}", source.id))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(anyhow::anyhow!("fetch {}: HTTP {}", source.id, response.status()).into());
        }

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| anyhow::anyhow!("fetch {}: {e}", source.id))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > self.config.max_body_bytes {
                return Err(anyhow::anyhow!(
                    "fetch {}: body larger than {} bytes",
                    source.id,
                    self.config.max_body_bytes
                )
                .into());
            }
        }

        let parsed: Value =
            serde_json::from_slice(&body).map_err(|e| anyhow::anyhow!("parse {}: {e}", source.id))?;
        Ok(extract_urls(
            &parsed,
            &source.json_pointer,
            source.url_key.as_deref(),
        ))
    }

    /// Parse URLs into candidates, dropping those already validated.
    async fn to_new_candidates(&self, urls: Vec<String>) -> Result<(Vec<Candidate>, u64)> {
        let mut seen = HashSet::new();
        let mut relays = Vec::new();
        for url in urls {
            if let Ok(relay) = Relay::parse(url.trim()) {
                if seen.insert(relay.url().to_string()) {
                    relays.push(relay);
                }
            }
        }

        let urls: Vec<String> = relays.iter().map(|r| r.url().to_string()).collect();
        let existing: HashSet<String> = self.store.relay_urls(&urls).await?.into_iter().collect();

        let mut skipped = 0u64;
        let candidates = relays
            .into_iter()
            .filter(|relay| {
                let known = existing.contains(relay.url());
                if known {
                    skipped += 1;
                }
                !known
            })
            .map(Candidate::new)
            .collect();
        Ok((candidates, skipped))
    }

    async fn insert_candidates(&self, candidates: &[Candidate]) -> Result<u64> {
        let now = now_ts();
        let mut states = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            states.push(candidate.to_state(ServiceName::Validator, now)?);
        }
        let mut written = 0u64;
        for chunk in states.chunks(self.store.max_batch_size()) {
            written += self.store.upsert_service_state(chunk).await?;
        }
        Ok(written)
    }
}

#[async_trait]
impl Service for Finder {
    fn name(&self) -> ServiceName {
        ServiceName::Finder
    }

    async fn run(&mut self) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        // API registries, each with its own cursor
        for source in &self.config.api_sources {
            match self.fetch_api_source(source).await {
                Ok(urls) => {
                    let found = urls.len();
                    let (candidates, skipped) = self.to_new_candidates(urls).await?;
                    let written = self.insert_candidates(&candidates).await?;
                    self.save_cursor(&source.id, now_ts()).await?;
                    stats.succeeded += written;
                    stats.skipped += skipped;
                    tracing::info!(
                        target: "bigbrotr::services::finder",
                        "api_source_done source={} found={found} new={written}",
                        source.id
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(
                        target: "bigbrotr::services::finder",
                        "api_source_failed source={} error={e}",
                        source.id
                    );
                }
            }
        }

        // Relay URLs from stored events' tags
        if self.config.scan_events {
            let since = self.cursor_value("events").await?.unwrap_or(0);
            let rows = self
                .store
                .fetch_event_tag_urls(since, self.config.event_scan_limit)
                .await?;

            let max_created_at = rows.iter().map(|(_, ts)| *ts).max();
            let urls: Vec<String> = rows.into_iter().map(|(url, _)| url).collect();
            let found = urls.len();

            let (candidates, skipped) = self.to_new_candidates(urls).await?;
            let written = self.insert_candidates(&candidates).await?;
            if let Some(cursor) = max_created_at {
                self.save_cursor("events", cursor).await?;
            }
            stats.succeeded += written;
            stats.skipped += skipped;
            tracing::info!(
                target: "bigbrotr::services::finder",
                "event_scan_done since={since} found={found} new={written}"
            );
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_top_level_array() {
        let body = json!(["wss://a.example.com", "wss://b.example.com", 42]);
        assert_eq!(
            extract_urls(&body, "", None),
            vec!["wss://a.example.com", "wss://b.example.com"]
        );
    }

    #[test]
    fn extracts_via_pointer() {
        let body = json!({"data": {"relays": ["wss://a.example.com"]}});
        assert_eq!(
            extract_urls(&body, "/data/relays", None),
            vec!["wss://a.example.com"]
        );
    }

    #[test]
    fn extracts_from_object_entries() {
        let body = json!({"relays": [
            {"url": "wss://a.example.com", "count": 3},
            {"url": 7},
            {"other": "wss://ignored.example.com"}
        ]});
        assert_eq!(
            extract_urls(&body, "/relays", Some("url")),
            vec!["wss://a.example.com"]
        );
    }

    #[test]
    fn missing_pointer_yields_nothing() {
        let body = json!({"relays": []});
        assert!(extract_urls(&body, "/nope", None).is_empty());
        assert!(extract_urls(&body, "/relays/0", None).is_empty());
    }

    #[test]
    fn config_validation() {
        assert!(FinderConfig::default().validate().is_ok());

        let config = FinderConfig {
            api_sources: vec![ApiSource {
                id: "nostr-watch".to_string(),
                url: "ftp://bad".to_string(),
                json_pointer: String::new(),
                url_key: None,
            }],
            ..FinderConfig::default()
        };
        assert!(config.validate().is_err());

        let config = FinderConfig {
            event_scan_limit: 0,
            ..FinderConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
