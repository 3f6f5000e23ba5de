use std::path::Path;
use std::time::Duration;

use nostr_sdk::prelude::*;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::NetworkType;

/// Environment variable holding the service signing key.
pub const ENV_PRIVATE_KEY: &str = "PRIVATE_KEY";
/// Environment variable holding the database password.
pub const ENV_DB_PASSWORD: &str = "DB_PASSWORD";

/// Load a YAML config file into a typed config struct.
pub fn load_yaml<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Retry policy with capped exponential backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_backoff: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            exponential_backoff: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be >= 1"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "must be >= initial_delay_ms",
            ));
        }
        Ok(())
    }

    /// Delay before the given retry (0-based attempt index).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms;
        let ms = if self.exponential_backoff {
            base.saturating_mul(1u64 << attempt.min(20))
        } else {
            base
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Shared database settings (`brotr.yaml`).
///
/// The password never appears in the file; it is read from
/// `DB_PASSWORD` when the config is loaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub dbname: String,
    pub min_size: u32,
    pub max_size: u32,
    pub acquire_timeout_secs: u64,
    pub health_check_timeout_secs: u64,
    pub application_name: String,
    pub timezone: String,
    pub retry: RetryConfig,
    pub max_batch_size: usize,
    #[serde(skip)]
    pub password: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "bigbrotr".to_string(),
            dbname: "bigbrotr".to_string(),
            min_size: 1,
            max_size: 10,
            acquire_timeout_secs: 10,
            health_check_timeout_secs: 5,
            application_name: "bigbrotr".to_string(),
            timezone: "UTC".to_string(),
            retry: RetryConfig::default(),
            max_batch_size: 10_000,
            password: String::new(),
        }
    }
}

impl DatabaseConfig {
    /// Load from YAML and pull the password from the environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config: Self = load_yaml(path)?;
        config.password = std::env::var(ENV_DB_PASSWORD)
            .map_err(|_| ConfigError::MissingEnv(ENV_DB_PASSWORD.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size < self.min_size {
            return Err(ConfigError::invalid(
                "database.max_size",
                "must be >= min_size",
            ));
        }
        if self.max_size == 0 {
            return Err(ConfigError::invalid("database.max_size", "must be >= 1"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid(
                "database.max_batch_size",
                "must be >= 1",
            ));
        }
        self.retry.validate()
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

/// Settings for relays on a single network type.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkTypeConfig {
    pub enabled: bool,
    pub proxy_url: Option<String>,
    pub max_tasks: usize,
    pub timeout_secs: u64,
}

impl Default for NetworkTypeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proxy_url: None,
            max_tasks: 10,
            timeout_secs: 10,
        }
    }
}

impl NetworkTypeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-network connectivity and concurrency settings shared by the
/// pipeline services. Overlay networks stay disabled until a proxy is
/// deployed next to the service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworksConfig {
    pub clearnet: NetworkTypeConfig,
    pub tor: NetworkTypeConfig,
    pub i2p: NetworkTypeConfig,
    pub loki: NetworkTypeConfig,
}

impl Default for NetworksConfig {
    fn default() -> Self {
        Self {
            clearnet: NetworkTypeConfig {
                enabled: true,
                proxy_url: None,
                max_tasks: 50,
                timeout_secs: 10,
            },
            tor: NetworkTypeConfig {
                enabled: false,
                proxy_url: Some("socks5://127.0.0.1:9050".to_string()),
                max_tasks: 10,
                timeout_secs: 30,
            },
            i2p: NetworkTypeConfig {
                enabled: false,
                proxy_url: Some("socks5://127.0.0.1:4447".to_string()),
                max_tasks: 5,
                timeout_secs: 45,
            },
            loki: NetworkTypeConfig {
                enabled: false,
                proxy_url: Some("socks5://127.0.0.1:1080".to_string()),
                max_tasks: 5,
                timeout_secs: 30,
            },
        }
    }
}

impl NetworksConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, net) in self.iter() {
            if net.max_tasks == 0 || net.max_tasks > 200 {
                return Err(ConfigError::invalid(
                    format!("networks.{name}.max_tasks"),
                    "must be in 1..=200",
                ));
            }
            if net.timeout_secs == 0 || net.timeout_secs > 120 {
                return Err(ConfigError::invalid(
                    format!("networks.{name}.timeout_secs"),
                    "must be in 1..=120",
                ));
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &NetworkTypeConfig)> {
        [
            ("clearnet", &self.clearnet),
            ("tor", &self.tor),
            ("i2p", &self.i2p),
            ("loki", &self.loki),
        ]
        .into_iter()
    }

    /// Settings for a network; local and unknown hosts fall back to the
    /// clearnet budget.
    pub fn get(&self, network: NetworkType) -> &NetworkTypeConfig {
        match network {
            NetworkType::Clearnet | NetworkType::Local | NetworkType::Unknown => &self.clearnet,
            NetworkType::Tor => &self.tor,
            NetworkType::I2p => &self.i2p,
            NetworkType::Loki => &self.loki,
        }
    }

    pub fn is_enabled(&self, network: NetworkType) -> bool {
        self.get(network).enabled
    }

    /// Proxy URL for an enabled overlay network; clearnet never proxies.
    pub fn proxy_url(&self, network: NetworkType) -> Option<&str> {
        if !network.is_overlay() {
            return None;
        }
        let config = self.get(network);
        if config.enabled {
            config.proxy_url.as_deref()
        } else {
            None
        }
    }
}

/// Driver settings shared by every service config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub interval_secs: u64,
    pub max_consecutive_failures: u32,
    pub metrics_enabled: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            max_consecutive_failures: 5,
            metrics_enabled: false,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::invalid("driver.interval_secs", "must be >= 1"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid(
                "driver.max_consecutive_failures",
                "must be >= 1",
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Layout of a per-service YAML file: a pointer to the shared
/// `brotr.yaml`, the driver settings, and the service's own section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile<T> {
    /// Path to the shared database config, resolved relative to this
    /// file's directory when not absolute.
    #[serde(default)]
    pub brotr: Option<std::path::PathBuf>,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub service: T,
}

impl<T: serde::de::DeserializeOwned + Default> ConfigFile<T> {
    /// Load a service config file and the shared database config it
    /// points at (default: `brotr.yaml` next to the service file).
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, DatabaseConfig), ConfigError> {
        let path = path.as_ref();
        let file: Self = load_yaml(path)?;
        file.driver.validate()?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let brotr_path = match &file.brotr {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => base.join(p),
            None => base.join("brotr.yaml"),
        };
        let database = DatabaseConfig::load(brotr_path)?;
        Ok((file, database))
    }
}

/// Load Nostr signing keys from an environment variable.
///
/// Accepts an nsec1 bech32 string, a 64-char hex secret key, or a BIP-39
/// mnemonic (NIP-06 derivation, account 0). Fails fast at config time so
/// a misconfigured monitor never reaches its first cycle.
pub fn load_keys_from_env(env_var: &str) -> Result<Keys, ConfigError> {
    let value =
        std::env::var(env_var).map_err(|_| ConfigError::MissingEnv(env_var.to_string()))?;
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::MissingEnv(env_var.to_string()));
    }

    if value.contains(' ') {
        return Keys::from_mnemonic(value, None::<&str>).map_err(|e| {
            ConfigError::invalid(env_var, format!("invalid NIP-06 mnemonic: {e}"))
        });
    }
    Keys::parse(value).map_err(|e| ConfigError::invalid(env_var, format!("invalid key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn retry_backoff_is_capped_exponential() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 500,
            exponential_backoff: true,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(3), Duration::from_millis(500));
        assert_eq!(retry.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn retry_fixed_delay_without_backoff() {
        let retry = RetryConfig {
            exponential_backoff: false,
            ..RetryConfig::default()
        };
        assert_eq!(retry.delay_for(0), retry.delay_for(5));
    }

    #[test]
    fn retry_rejects_zero_attempts() {
        let retry = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());
    }

    #[test]
    fn database_config_validates_pool_sizes() {
        let config = DatabaseConfig {
            min_size: 5,
            max_size: 2,
            ..DatabaseConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(DatabaseConfig::default().validate().is_ok());
    }

    #[test]
    fn networks_defaults_match_expected_budgets() {
        let nets = NetworksConfig::default();
        assert!(nets.clearnet.enabled);
        assert_eq!(nets.clearnet.max_tasks, 50);
        assert_eq!(nets.clearnet.timeout_secs, 10);
        assert_eq!(nets.tor.timeout_secs, 30);
        assert_eq!(nets.i2p.timeout_secs, 45);
        assert_eq!(nets.loki.timeout_secs, 30);
        assert!(!nets.tor.enabled);
    }

    #[test]
    fn networks_validate_bounds() {
        let mut nets = NetworksConfig::default();
        nets.tor.max_tasks = 0;
        assert!(nets.validate().is_err());

        let mut nets = NetworksConfig::default();
        nets.clearnet.timeout_secs = 500;
        assert!(nets.validate().is_err());
    }

    #[test]
    fn proxy_url_only_for_enabled_overlays() {
        let mut nets = NetworksConfig::default();
        assert_eq!(nets.proxy_url(NetworkType::Clearnet), None);
        assert_eq!(nets.proxy_url(NetworkType::Tor), None); // disabled

        nets.tor.enabled = true;
        assert_eq!(
            nets.proxy_url(NetworkType::Tor),
            Some("socks5://127.0.0.1:9050")
        );
    }

    #[test]
    fn local_network_uses_clearnet_settings() {
        let nets = NetworksConfig::default();
        assert_eq!(nets.get(NetworkType::Local).max_tasks, 50);
    }

    #[test]
    fn load_yaml_reads_typed_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "clearnet:\n  max_tasks: 7\n  timeout_secs: 3").unwrap();
        let nets: NetworksConfig = load_yaml(file.path()).unwrap();
        assert_eq!(nets.clearnet.max_tasks, 7);
        assert_eq!(nets.clearnet.timeout_secs, 3);
        // Unspecified networks keep their defaults
        assert_eq!(nets.i2p.timeout_secs, 45);
    }

    #[test]
    fn load_yaml_missing_file_is_not_found() {
        let err = load_yaml::<NetworksConfig>("/nonexistent/brotr.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn load_yaml_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "clearnet:\n  bogus_field: 1").unwrap();
        assert!(load_yaml::<NetworksConfig>(file.path()).is_err());
    }

    #[test]
    fn keys_from_env_hex_and_nsec() {
        let hex_key = "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa";
        // SAFETY: test-local env mutation
        unsafe { std::env::set_var("BIGBROTR_TEST_KEY_HEX", hex_key) };
        let keys = load_keys_from_env("BIGBROTR_TEST_KEY_HEX").unwrap();
        let nsec = keys.secret_key().to_bech32().unwrap();

        unsafe { std::env::set_var("BIGBROTR_TEST_KEY_NSEC", &nsec) };
        let keys2 = load_keys_from_env("BIGBROTR_TEST_KEY_NSEC").unwrap();
        assert_eq!(keys.public_key(), keys2.public_key());
    }

    #[test]
    fn keys_from_env_missing_is_config_error() {
        assert!(matches!(
            load_keys_from_env("BIGBROTR_TEST_KEY_UNSET"),
            Err(ConfigError::MissingEnv(_))
        ));
    }
}
