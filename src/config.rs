//! Configuration management for CEC Sink GW
//!
//! Handles loading and parsing of the YAML configuration file. Protocol
//! timings (poll interval, request timeouts, retry caps, ARC timer, key
//! spacing) are deliberately configuration rather than constants.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Identity of the sink itself as announced on the bus
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// OSD name announced in reply to Give OSD Name (max 14 bytes on the wire)
    #[serde(default = "default_osd_name")]
    pub osd_name: String,
    /// IEEE OUI vendor identifier, hex string (e.g. "0019FB")
    #[serde(default = "default_vendor_id")]
    pub vendor_id: String,
    /// ISO 639-2 menu language code
    #[serde(default = "default_language")]
    pub language: String,
    /// Number of HDMI input ports on this sink
    #[serde(default = "default_hdmi_ports")]
    pub hdmi_ports: u8,
    /// Input port wired for ARC (1-based port id)
    #[serde(default = "default_arc_port")]
    pub arc_port: u8,
}

/// Protocol timings and retry caps
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    /// Sleep between liveness cycles
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-frame send/ack timeout handed to the transport
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How long a device-info request may stay outstanding
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retries per device-info attribute before it is left unknown
    #[serde(default = "default_request_retries")]
    pub request_retries: u8,
    /// Bound on an ARC initiation/termination exchange
    #[serde(default = "default_arc_timeout_ms")]
    pub arc_timeout_ms: u64,
    /// Spacing between consecutive user-control frames
    #[serde(default = "default_key_spacing_ms")]
    pub key_spacing_ms: u64,
}

/// Where persisted CEC settings live
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_settings_db")]
    pub settings_db: String,
    /// Debounce window for settings writes, milliseconds
    #[serde(default = "default_settings_debounce_ms")]
    pub settings_debounce_ms: u64,
}

fn default_osd_name() -> String {
    "TV".to_string()
}
fn default_vendor_id() -> String {
    "0019FB".to_string()
}
fn default_language() -> String {
    "eng".to_string()
}
fn default_hdmi_ports() -> u8 {
    3
}
fn default_arc_port() -> u8 {
    1
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_send_timeout_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_request_retries() -> u8 {
    3
}
fn default_arc_timeout_ms() -> u64 {
    3000
}
fn default_key_spacing_ms() -> u64 {
    100
}
fn default_settings_db() -> String {
    ".state/cec-settings".to_string()
}
fn default_settings_debounce_ms() -> u64 {
    500
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            osd_name: default_osd_name(),
            vendor_id: default_vendor_id(),
            language: default_language(),
            hdmi_ports: default_hdmi_ports(),
            arc_port: default_arc_port(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            poll_interval_ms: default_poll_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            request_retries: default_request_retries(),
            arc_timeout_ms: default_arc_timeout_ms(),
            key_spacing_ms: default_key_spacing_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            settings_db: default_settings_db(),
            settings_debounce_ms: default_settings_debounce_ms(),
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn arc_timeout(&self) -> Duration {
        Duration::from_millis(self.arc_timeout_ms)
    }
    pub fn key_spacing(&self) -> Duration {
        Duration::from_millis(self.key_spacing_ms)
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that would otherwise surface as protocol misbehavior
    pub fn validate(&self) -> Result<()> {
        if self.device.hdmi_ports == 0 || self.device.hdmi_ports > 15 {
            anyhow::bail!("device.hdmi_ports must be between 1 and 15");
        }
        if self.device.arc_port == 0 || self.device.arc_port > self.device.hdmi_ports {
            anyhow::bail!(
                "device.arc_port {} is not one of the {} configured ports",
                self.device.arc_port,
                self.device.hdmi_ports
            );
        }
        if crate::message::VendorId::parse(&self.device.vendor_id).is_none() {
            anyhow::bail!("device.vendor_id is not a hex OUI: {}", self.device.vendor_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.hdmi_ports, 3);
        assert_eq!(config.timing.request_retries, 3);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "device:\n  osd_name: LivingRoom\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.device.osd_name, "LivingRoom");
        assert_eq!(config.device.vendor_id, "0019FB");
        assert_eq!(config.timing.poll_interval_ms, 5000);
    }

    #[test]
    fn arc_port_must_exist() {
        let yaml = "device:\n  hdmi_ports: 2\n  arc_port: 3\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
