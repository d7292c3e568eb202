//! Hierarchical configuration lookup and channel settings.
//!
//! Configuration is a tree of mappings. A lookup of `key` under
//! `"Machines/Line1/Boiler"` checks `Machines/Line1/Boiler`, then
//! `Machines/Line1`, then `Machines`, then the root, and returns the first
//! hit. Values are handed out as strings and parsed by the consumer.
//!
//! ```rust
//! use voltage_fieldbus::config::{ConfigProvider, TreeConfigProvider};
//!
//! let provider = TreeConfigProvider::from_yaml_str(r#"
//! timeout_ms: 3000
//! COM1:
//!   baud_rate: 19200
//! "#).unwrap();
//!
//! assert_eq!(provider.get_value("COM1", "baud_rate").as_deref(), Some("19200"));
//! assert_eq!(provider.get_value("COM1", "timeout_ms").as_deref(), Some("3000"));
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{FieldbusError, FieldbusResult};
use crate::DEFAULT_TIMEOUT_MS;

/// Key/value configuration with child-to-root fallback
pub trait ConfigProvider: Send + Sync {
    fn get_value(&self, path: &str, key: &str) -> Option<String>;
}

/// Provider with no entries, every lookup falls back to defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyConfigProvider;

impl ConfigProvider for EmptyConfigProvider {
    fn get_value(&self, _path: &str, _key: &str) -> Option<String> {
        None
    }
}

/// Provider backed by a YAML or JSON document
#[derive(Debug, Clone)]
pub struct TreeConfigProvider {
    root: JsonValue,
}

impl TreeConfigProvider {
    pub fn new(root: JsonValue) -> Self {
        Self { root }
    }

    pub fn from_yaml_str(text: &str) -> FieldbusResult<Self> {
        let root: JsonValue = serde_yaml::from_str(text)?;
        Ok(Self::new(root))
    }

    pub fn from_json_str(text: &str) -> FieldbusResult<Self> {
        let root: JsonValue = serde_json::from_str(text)?;
        Ok(Self::new(root))
    }

    fn node(&self, segments: &[&str]) -> Option<&JsonValue> {
        segments
            .iter()
            .try_fold(&self.root, |node, segment| node.get(*segment))
    }
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl ConfigProvider for TreeConfigProvider {
    fn get_value(&self, path: &str, key: &str) -> Option<String> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        (0..=segments.len())
            .rev()
            .filter_map(|depth| self.node(&segments[..depth]))
            .find_map(|node| node.get(key).and_then(scalar_to_string))
    }
}

fn lookup<T: FromStr>(provider: &dyn ConfigProvider, path: &str, key: &str) -> FieldbusResult<Option<T>> {
    match provider.get_value(path, key) {
        None => Ok(None),
        Some(text) => text.trim().parse::<T>().map(Some).map_err(|_| {
            FieldbusError::configuration(format!("{}/{}: cannot parse '{}'", path, key, text))
        }),
    }
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl FromStr for Parity {
    type Err = FieldbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "odd" | "o" => Ok(Parity::Odd),
            "even" | "e" => Ok(Parity::Even),
            other => Err(FieldbusError::configuration(format!("unknown parity '{}'", other))),
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Transport parameters of one connector
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    /// Reply timeout per attempt
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Allow several requests in flight, matched by correlation key
    pub full_duplex: bool,
    /// Sleep standing in for the reply of fire-and-forget devices
    pub no_response_sleep: Duration,
    /// Queued messages before the controller reports saturation
    pub max_pending: usize,
    /// Log every frame through the connector's logger
    pub packet_logging: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            full_duplex: false,
            no_response_sleep: Duration::from_millis(100),
            max_pending: 32,
            packet_logging: false,
        }
    }
}

impl ChannelSettings {
    /// Start from the defaults and apply every value the provider knows under `path`
    pub fn resolve(provider: &dyn ConfigProvider, path: &str) -> FieldbusResult<Self> {
        let mut settings = Self::default();
        if let Some(ms) = lookup::<u64>(provider, path, "timeout_ms")? {
            settings.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup::<u64>(provider, path, "connect_timeout_ms")? {
            settings.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(baud) = lookup(provider, path, "baud_rate")? {
            settings.baud_rate = baud;
        }
        if let Some(bits) = lookup(provider, path, "data_bits")? {
            settings.data_bits = bits;
        }
        if let Some(bits) = lookup(provider, path, "stop_bits")? {
            settings.stop_bits = bits;
        }
        if let Some(parity) = lookup(provider, path, "parity")? {
            settings.parity = parity;
        }
        if let Some(full_duplex) = lookup(provider, path, "full_duplex")? {
            settings.full_duplex = full_duplex;
        }
        if let Some(ms) = lookup::<u64>(provider, path, "no_response_sleep_ms")? {
            settings.no_response_sleep = Duration::from_millis(ms);
        }
        if let Some(max) = lookup(provider, path, "max_pending")? {
            settings.max_pending = max;
        }
        if let Some(logging) = lookup(provider, path, "packet_logging")? {
            settings.packet_logging = logging;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_full_duplex(mut self, full_duplex: bool) -> Self {
        self.full_duplex = full_duplex;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn with_no_response_sleep(mut self, sleep: Duration) -> Self {
        self.no_response_sleep = sleep;
        self
    }

    pub fn validate(&self) -> FieldbusResult<()> {
        if self.timeout.is_zero() {
            return Err(FieldbusError::configuration("timeout must be positive"));
        }
        if self.baud_rate == 0 {
            return Err(FieldbusError::configuration("baud rate must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(FieldbusError::configuration(format!(
                "data bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(FieldbusError::configuration(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.max_pending == 0 {
            return Err(FieldbusError::configuration("max_pending must be positive"));
        }
        Ok(())
    }

    pub fn serial_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    pub fn serial_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    /// Silent interval marking the end of a serial frame: 3.5 character times
    pub fn frame_gap(&self) -> Duration {
        // 11 bits per character
        let char_time_us = (11_000_000 / self.baud_rate) as u64;
        Duration::from_micros(char_time_us * 35 / 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
timeout_ms: 2000
Plant:
  parity: even
  Line1:
    baud_rate: 19200
    Boiler:
      full_duplex: true
"#;

    #[test]
    fn test_child_to_root_fallback() {
        let provider = TreeConfigProvider::from_yaml_str(YAML).unwrap();
        let path = "Plant/Line1/Boiler";
        assert_eq!(provider.get_value(path, "full_duplex").as_deref(), Some("true"));
        assert_eq!(provider.get_value(path, "baud_rate").as_deref(), Some("19200"));
        assert_eq!(provider.get_value(path, "parity").as_deref(), Some("even"));
        assert_eq!(provider.get_value(path, "timeout_ms").as_deref(), Some("2000"));
        assert_eq!(provider.get_value(path, "missing"), None);
        assert_eq!(provider.get_value("Plant", "baud_rate"), None);
        assert_eq!(provider.get_value("Unknown/Path", "timeout_ms").as_deref(), Some("2000"));
    }

    #[test]
    fn test_json_provider() {
        let provider = TreeConfigProvider::from_json_str(r#"{"COM1": {"baud_rate": 4800}}"#).unwrap();
        assert_eq!(provider.get_value("COM1", "baud_rate").as_deref(), Some("4800"));
    }

    #[test]
    fn test_resolve_settings() {
        let provider = TreeConfigProvider::from_yaml_str(YAML).unwrap();
        let settings = ChannelSettings::resolve(&provider, "Plant/Line1/Boiler").unwrap();
        assert_eq!(settings.timeout, Duration::from_millis(2000));
        assert_eq!(settings.baud_rate, 19200);
        assert_eq!(settings.parity, Parity::Even);
        assert!(settings.full_duplex);
        assert_eq!(settings.data_bits, 8);

        let defaults = ChannelSettings::resolve(&EmptyConfigProvider, "anything").unwrap();
        assert_eq!(defaults, ChannelSettings::default());
    }

    #[test]
    fn test_invalid_values() {
        let provider = TreeConfigProvider::from_yaml_str("baud_rate: fast").unwrap();
        let err = ChannelSettings::resolve(&provider, "").unwrap_err();
        assert!(matches!(err, FieldbusError::Configuration { .. }));

        let provider = TreeConfigProvider::from_yaml_str("data_bits: 9").unwrap();
        assert!(ChannelSettings::resolve(&provider, "").is_err());
    }

    #[test]
    fn test_frame_gap() {
        let settings = ChannelSettings {
            baud_rate: 9600,
            ..Default::default()
        };
        // 1145us per character at 9600 baud
        assert_eq!(settings.frame_gap(), Duration::from_micros(4007));
    }
}
