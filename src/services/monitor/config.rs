use std::path::PathBuf;

use serde::Deserialize;

use crate::config::NetworksConfig;
use crate::error::ConfigError;
use crate::nips::nip66::Nip66Selection;

/// GeoLite2 database locations. Either may be absent, silently skipping
/// the geo or net dimension.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeoIpConfig {
    pub city_db: Option<PathBuf>,
    pub asn_db: Option<PathBuf>,
}

/// Kind 0 profile content for the monitor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub name: String,
    pub about: Option<String>,
    pub picture: Option<String>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: "bigbrotr-monitor".to_string(),
            about: Some("BigBrotr NIP-66 relay monitor".to_string()),
            picture: None,
        }
    }
}

/// Publishing of Kind 0 / 10166 / 30166 events.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishingConfig {
    pub enabled: bool,
    pub publish_profile: bool,
    pub publish_announcement: bool,
    pub publish_discovery: bool,
    /// Relays receiving the published events.
    pub relays: Vec<String>,
    pub timeout_secs: u64,
    pub profile: ProfileConfig,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            publish_profile: true,
            publish_announcement: true,
            publish_discovery: true,
            relays: Vec::new(),
            timeout_secs: 30,
            profile: ProfileConfig::default(),
        }
    }
}

/// Monitor settings (`monitor.yaml`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// A relay is due when its last check is older than this.
    pub staleness_secs: i64,
    /// Relays checked per cycle.
    pub chunk_size: i64,
    pub nip11_enabled: bool,
    pub allow_insecure: bool,
    pub checks: Nip66Selection,
    pub networks: NetworksConfig,
    pub geoip: GeoIpConfig,
    pub publishing: PublishingConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 86_400,
            chunk_size: 200,
            nip11_enabled: true,
            allow_insecure: true,
            checks: Nip66Selection::default(),
            networks: NetworksConfig::default(),
            geoip: GeoIpConfig::default(),
            publishing: PublishingConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.staleness_secs <= 0 {
            return Err(ConfigError::invalid("monitor.staleness_secs", "must be >= 1"));
        }
        if self.chunk_size <= 0 {
            return Err(ConfigError::invalid("monitor.chunk_size", "must be >= 1"));
        }
        if self.publishing.enabled && self.publishing.relays.is_empty() {
            return Err(ConfigError::invalid(
                "monitor.publishing.relays",
                "required when publishing is enabled",
            ));
        }
        self.networks.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(MonitorConfig::default().validate().is_ok());
    }

    #[test]
    fn staleness_must_be_positive() {
        let config = MonitorConfig {
            staleness_secs: 0,
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn publishing_requires_relays() {
        let mut config = MonitorConfig::default();
        config.publishing.enabled = true;
        assert!(config.validate().is_err());

        config.publishing.relays = vec!["wss://relay.damus.io".to_string()];
        assert!(config.validate().is_ok());
    }
}
