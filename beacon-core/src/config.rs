// Tracking configuration and its persisted store
//
// Three fields (device id, server URL, sampling interval), each validated on
// its own so a partial edit can keep the valid parts and drop the rest.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use url::Url;

use crate::relay::Destination;

pub const DEFAULT_DEVICE_ID: &str = "gps-beacon";
pub const DEFAULT_SERVER_URL: &str = "http://localhost:5055";
pub const DEFAULT_INTERVAL_SECS: u32 = 10;

pub const DEVICE_ID_KEY: &str = "gps_beacon.device_id";
pub const SERVER_URL_KEY: &str = "gps_beacon.server_url";
pub const INTERVAL_KEY: &str = "gps_beacon.interval";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    DeviceIdentifier,
    ServerEndpoint,
    SamplingInterval,
}

impl ConfigField {
    /// Wire name of the field, as used by the settings form
    pub fn key(self) -> &'static str {
        match self {
            ConfigField::DeviceIdentifier => "deviceIdentifier",
            ConfigField::ServerEndpoint => "serverEndpoint",
            ConfigField::SamplingInterval => "samplingIntervalSeconds",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigField::DeviceIdentifier => write!(f, "device ID"),
            ConfigField::ServerEndpoint => write!(f, "server URL"),
            ConfigField::SamplingInterval => write!(f, "interval"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Device ID must not be empty")]
    EmptyDeviceId,

    #[error("Server URL is invalid: {0}")]
    InvalidServerUrl(String),

    #[error("Interval must be a whole number of seconds, at least 1 (got {0})")]
    InvalidInterval(String),

    #[error("Missing {0}")]
    Missing(ConfigField),
}

impl ConfigError {
    /// Which field the error is about, so the settings form can highlight it
    pub fn field(&self) -> ConfigField {
        match self {
            ConfigError::EmptyDeviceId => ConfigField::DeviceIdentifier,
            ConfigError::InvalidServerUrl(_) => ConfigField::ServerEndpoint,
            ConfigError::InvalidInterval(_) => ConfigField::SamplingInterval,
            ConfigError::Missing(field) => *field,
        }
    }
}

/// Trimmed, non-empty device identifier
pub fn validate_device_id(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyDeviceId);
    }
    Ok(trimmed.to_string())
}

/// Absolute http/https URL with a host
pub fn validate_server_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| ConfigError::InvalidServerUrl(format!("'{}' ({})", trimmed, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ConfigError::InvalidServerUrl(format!(
                "unsupported scheme '{}', use http or https",
                other
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidServerUrl(format!(
            "'{}' has no host",
            trimmed
        )));
    }

    Ok(trimmed.to_string())
}

pub fn validate_interval(seconds: u32) -> Result<u32, ConfigError> {
    if seconds < 1 {
        return Err(ConfigError::InvalidInterval(seconds.to_string()));
    }
    Ok(seconds)
}

/// Parse the decimal text form used in storage and form inputs
pub fn parse_interval(raw: &str) -> Result<u32, ConfigError> {
    let trimmed = raw.trim();
    let seconds = trimmed
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidInterval(trimmed.to_string()))?;
    validate_interval(seconds)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingConfiguration {
    pub device_identifier: String,
    pub server_endpoint: String,
    pub sampling_interval_seconds: u32,
}

impl Default for TrackingConfiguration {
    fn default() -> Self {
        Self {
            device_identifier: DEFAULT_DEVICE_ID.to_string(),
            server_endpoint: DEFAULT_SERVER_URL.to_string(),
            sampling_interval_seconds: DEFAULT_INTERVAL_SECS,
        }
    }
}

impl TrackingConfiguration {
    pub fn new(
        device_identifier: impl Into<String>,
        server_endpoint: impl Into<String>,
        sampling_interval_seconds: u32,
    ) -> Self {
        Self {
            device_identifier: device_identifier.into(),
            server_endpoint: server_endpoint.into(),
            sampling_interval_seconds,
        }
    }

    /// All three fields must be valid at once before forwarding may start
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device_identifier)?;
        validate_server_url(&self.server_endpoint)?;
        validate_interval(self.sampling_interval_seconds)?;
        Ok(())
    }

    pub fn interval_ms(&self) -> u64 {
        u64::from(self.sampling_interval_seconds) * 1000
    }

    pub fn destination(&self) -> Destination {
        Destination {
            server_endpoint: self.server_endpoint.clone(),
            device_identifier: self.device_identifier.clone(),
        }
    }

    /// Apply the valid fields of `update`; invalid ones are returned and left untouched
    pub fn apply(&mut self, update: ConfigUpdate) -> Vec<ConfigError> {
        let (valid, errors) = update.validated();
        if let Some(device_identifier) = valid.device_identifier {
            self.device_identifier = device_identifier;
        }
        if let Some(server_endpoint) = valid.server_endpoint {
            self.server_endpoint = server_endpoint;
        }
        if let Some(seconds) = valid.sampling_interval_seconds {
            self.sampling_interval_seconds = seconds;
        }
        errors
    }
}

/// Partial configuration: the unit of user edits and of `update-config`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_identifier: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_interval_seconds: Option<u32>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.device_identifier.is_none()
            && self.server_endpoint.is_none()
            && self.sampling_interval_seconds.is_none()
    }

    /// Fields present in `other` overwrite ours
    pub fn merge(&mut self, other: ConfigUpdate) {
        if other.device_identifier.is_some() {
            self.device_identifier = other.device_identifier;
        }
        if other.server_endpoint.is_some() {
            self.server_endpoint = other.server_endpoint;
        }
        if other.sampling_interval_seconds.is_some() {
            self.sampling_interval_seconds = other.sampling_interval_seconds;
        }
    }

    /// Split into the normalized valid fields and the errors of the invalid ones
    pub fn validated(self) -> (ConfigUpdate, Vec<ConfigError>) {
        let mut valid = ConfigUpdate::default();
        let mut errors = Vec::new();

        if let Some(raw) = self.device_identifier {
            match validate_device_id(&raw) {
                Ok(v) => valid.device_identifier = Some(v),
                Err(e) => errors.push(e),
            }
        }
        if let Some(raw) = self.server_endpoint {
            match validate_server_url(&raw) {
                Ok(v) => valid.server_endpoint = Some(v),
                Err(e) => errors.push(e),
            }
        }
        if let Some(seconds) = self.sampling_interval_seconds {
            match validate_interval(seconds) {
                Ok(v) => valid.sampling_interval_seconds = Some(v),
                Err(e) => errors.push(e),
            }
        }

        (valid, errors)
    }

    pub fn complete(&self) -> Result<TrackingConfiguration, ConfigError> {
        let config = TrackingConfiguration {
            device_identifier: self
                .device_identifier
                .clone()
                .ok_or(ConfigError::Missing(ConfigField::DeviceIdentifier))?,
            server_endpoint: self
                .server_endpoint
                .clone()
                .ok_or(ConfigError::Missing(ConfigField::ServerEndpoint))?,
            sampling_interval_seconds: self
                .sampling_interval_seconds
                .ok_or(ConfigError::Missing(ConfigField::SamplingInterval))?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<TrackingConfiguration> for ConfigUpdate {
    fn from(config: TrackingConfiguration) -> Self {
        Self {
            device_identifier: Some(config.device_identifier),
            server_endpoint: Some(config.server_endpoint),
            sampling_interval_seconds: Some(config.sampling_interval_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to read {key}: {reason}")]
    Read { key: String, reason: String },

    #[error("Failed to write {key}: {reason}")]
    Write { key: String, reason: String },
}

/// String key-value persistence (browser localStorage in production)
pub trait KeyValueStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// In-memory storage; clones share the same entries
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Rc<RefCell<BTreeMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Configuration store with last-write-wins persistence
///
/// When the storage medium fails the store keeps working from memory
/// (session-only) and stops touching storage.
pub struct ConfigStore<S> {
    storage: S,
    current: TrackingConfiguration,
    degraded: bool,
}

impl<S: KeyValueStorage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            current: TrackingConfiguration::default(),
            degraded: false,
        }
    }

    pub fn current(&self) -> &TrackingConfiguration {
        &self.current
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Read all three fields, falling back to defaults for missing or invalid ones
    pub fn load(&mut self) -> TrackingConfiguration {
        if self.degraded {
            return self.current.clone();
        }

        let defaults = TrackingConfiguration::default();

        let device_identifier = self
            .read(DEVICE_ID_KEY)
            .and_then(|raw| keep_valid(DEVICE_ID_KEY, validate_device_id(&raw)))
            .unwrap_or(defaults.device_identifier);
        let server_endpoint = self
            .read(SERVER_URL_KEY)
            .and_then(|raw| keep_valid(SERVER_URL_KEY, validate_server_url(&raw)))
            .unwrap_or(defaults.server_endpoint);
        let sampling_interval_seconds = self
            .read(INTERVAL_KEY)
            .and_then(|raw| keep_valid(INTERVAL_KEY, parse_interval(&raw)))
            .unwrap_or(defaults.sampling_interval_seconds);

        if self.degraded {
            // storage broke mid-load; keep what this session already had
            return self.current.clone();
        }

        self.current = TrackingConfiguration {
            device_identifier,
            server_endpoint,
            sampling_interval_seconds,
        };
        self.current.clone()
    }

    /// Persist the valid fields of `update`; invalid ones are returned and never stored
    pub fn save(&mut self, update: ConfigUpdate) -> Vec<ConfigError> {
        let (valid, errors) = update.validated();

        for error in &errors {
            log::warn!("Ignoring invalid {}: {}", error.field(), error);
        }

        if let Some(device_identifier) = valid.device_identifier {
            self.write(DEVICE_ID_KEY, &device_identifier);
            self.current.device_identifier = device_identifier;
        }
        if let Some(server_endpoint) = valid.server_endpoint {
            self.write(SERVER_URL_KEY, &server_endpoint);
            self.current.server_endpoint = server_endpoint;
        }
        if let Some(seconds) = valid.sampling_interval_seconds {
            self.write(INTERVAL_KEY, &seconds.to_string());
            self.current.sampling_interval_seconds = seconds;
        }

        errors
    }

    fn read(&mut self, key: &str) -> Option<String> {
        if self.degraded {
            return None;
        }
        match self.storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                self.degrade(&e);
                None
            }
        }
    }

    fn write(&mut self, key: &str, value: &str) {
        if self.degraded {
            return;
        }
        if let Err(e) = self.storage.set(key, value) {
            self.degrade(&e);
        }
    }

    fn degrade(&mut self, error: &StorageError) {
        log::warn!(
            "{}; settings will only last for this session",
            error
        );
        self.degraded = true;
    }
}

fn keep_valid<T>(key: &str, result: Result<T, ConfigError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Stored value for {} is invalid ({}), using default", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStorage;

    impl KeyValueStorage for BrokenStorage {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("blocked by privacy settings".into()))
        }

        fn set(&self, key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Write {
                key: key.into(),
                reason: "quota exceeded".into(),
            })
        }
    }

    #[test]
    fn test_server_url_validation() {
        assert!(validate_server_url("http://example.com:5055").is_ok());
        assert!(validate_server_url("https://track.example.org/osmand").is_ok());
        assert!(validate_server_url("  http://example.com  ").is_ok());

        assert!(matches!(
            validate_server_url("ftp://example.com"),
            Err(ConfigError::InvalidServerUrl(_))
        ));
        assert!(validate_server_url("example.com:5055").is_err());
        assert!(validate_server_url("not a url").is_err());
        assert!(validate_server_url("").is_err());
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(parse_interval("5"), Ok(5));
        assert_eq!(parse_interval(" 30 "), Ok(30));
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("-3").is_err());
        assert!(parse_interval("2.5").is_err());
        assert!(parse_interval("").is_err());
    }

    #[test]
    fn test_validate_reports_first_invalid_field() {
        let config = TrackingConfiguration::new("  ", "http://example.com", 5);
        assert_eq!(config.validate(), Err(ConfigError::EmptyDeviceId));
        assert_eq!(
            config.validate().unwrap_err().field(),
            ConfigField::DeviceIdentifier
        );

        let config = TrackingConfiguration::new("dev1", "http://example.com", 0);
        assert_eq!(
            config.validate().unwrap_err().field(),
            ConfigField::SamplingInterval
        );
    }

    #[test]
    fn test_load_uses_defaults_when_empty() {
        let mut store = ConfigStore::new(MemoryStorage::new());
        assert_eq!(store.load(), TrackingConfiguration::default());
        assert!(!store.is_degraded());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let storage = MemoryStorage::new();
        let config = TrackingConfiguration::new("dev1", "http://example.com:5055", 5);

        let mut store = ConfigStore::new(storage.clone());
        assert!(store.save(config.clone().into()).is_empty());

        let mut reopened = ConfigStore::new(storage.clone());
        assert_eq!(reopened.load(), config);
        assert_eq!(
            storage.get(INTERVAL_KEY).unwrap().as_deref(),
            Some("5")
        );
    }

    #[test]
    fn test_invalid_server_url_keeps_previous_value() {
        let storage = MemoryStorage::new();
        let mut store = ConfigStore::new(storage.clone());
        store.save(TrackingConfiguration::new("dev1", "http://example.com:5055", 5).into());

        let errors = store.save(ConfigUpdate {
            device_identifier: Some("dev2".into()),
            server_endpoint: Some("javascript:alert(1)".into()),
            sampling_interval_seconds: None,
        });

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field(), ConfigField::ServerEndpoint);
        assert_eq!(
            storage.get(SERVER_URL_KEY).unwrap().as_deref(),
            Some("http://example.com:5055")
        );

        let loaded = ConfigStore::new(storage).load();
        assert_eq!(loaded.device_identifier, "dev2");
        assert_eq!(loaded.server_endpoint, "http://example.com:5055");
    }

    #[test]
    fn test_corrupt_stored_values_fall_back_to_defaults() {
        let storage = MemoryStorage::new();
        storage.set(DEVICE_ID_KEY, "dev9").unwrap();
        storage.set(SERVER_URL_KEY, "nope").unwrap();
        storage.set(INTERVAL_KEY, "zero").unwrap();

        let loaded = ConfigStore::new(storage).load();
        assert_eq!(loaded.device_identifier, "dev9");
        assert_eq!(loaded.server_endpoint, DEFAULT_SERVER_URL);
        assert_eq!(loaded.sampling_interval_seconds, DEFAULT_INTERVAL_SECS);
    }

    #[test]
    fn test_unavailable_storage_degrades_to_session_only() {
        let mut store = ConfigStore::new(BrokenStorage);
        assert_eq!(store.load(), TrackingConfiguration::default());
        assert!(store.is_degraded());

        let errors = store.save(ConfigUpdate {
            sampling_interval_seconds: Some(42),
            ..Default::default()
        });
        assert!(errors.is_empty());
        assert_eq!(store.load().sampling_interval_seconds, 42);
    }

    #[test]
    fn test_config_wire_names() {
        let json = serde_json::to_value(TrackingConfiguration::new("dev1", "http://h", 5)).unwrap();
        assert_eq!(json["deviceIdentifier"], "dev1");
        assert_eq!(json["serverEndpoint"], "http://h");
        assert_eq!(json["samplingIntervalSeconds"], 5);

        for error in [
            ConfigError::EmptyDeviceId,
            ConfigError::InvalidServerUrl("x".into()),
            ConfigError::InvalidInterval("0".into()),
        ] {
            assert!(json.get(error.field().key()).is_some());
        }
    }
}
