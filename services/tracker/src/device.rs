//! Device context captured alongside every record.
//!
//! The host platform supplies the raw readings through [`DeviceStatusProvider`];
//! [`DeviceStatusSnapshot::capture`] folds them into the document attached to
//! each outgoing record.

use crate::config::DeviceConfig;
use serde::{Deserialize, Serialize};

/// Active network transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkType {
    Wifi,
    Mobile,
    #[default]
    None,
}

/// Connectivity of the active network, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub has_internet: bool,
    pub transport: NetworkType,
}

/// Raw battery reading. A negative level or scale means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub level: i32,
    pub scale: i32,
    pub charging: bool,
}

impl BatteryReading {
    /// Charge as a truncated percentage, `None` when the reading is unknown
    pub fn percent(&self) -> Option<u8> {
        if self.level < 0 || self.scale <= 0 {
            return None;
        }
        let percent = (self.level as f32 / self.scale as f32 * 100.0) as i64;
        Some(percent.clamp(0, 100) as u8)
    }
}

/// Location permission grants as seen by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionStatus {
    pub fine_location: bool,
    pub background_location: bool,
}

/// Hardware and OS identification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub device: String,
    pub os_version: String,
}

impl DeviceInfo {
    /// Identifier stored on each record: `<manufacturer>-<device>`
    pub fn identifier(&self) -> String {
        format!("{}-{}", self.manufacturer, self.device)
    }
}

/// Synchronous accessors for the device state that enrichment records.
pub trait DeviceStatusProvider: Send + Sync {
    fn device_info(&self) -> DeviceInfo;
    fn screen_on(&self) -> bool;
    fn locked(&self) -> bool;
    fn power_save_mode(&self) -> bool;
    fn battery(&self) -> BatteryReading;
    /// `None` when there is no active network
    fn network(&self) -> Option<NetworkInfo>;
    fn gps_enabled(&self) -> bool;
    fn permissions(&self) -> PermissionStatus;
}

/// Answers whether location sampling may start at all.
pub trait PermissionChecker: Send + Sync {
    fn has_location_permission(&self) -> bool;
}

/// Point-in-time device context attached to a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusSnapshot {
    pub manufacturer: String,
    pub model: String,
    pub os_version: String,
    pub screen_on: bool,
    #[serde(rename = "deviceLocked")]
    pub locked: bool,
    pub battery_percent: Option<u8>,
    pub charging: bool,
    pub power_save_mode: bool,
    pub has_internet: bool,
    pub network_type: NetworkType,
    pub gps_enabled: bool,
    pub fine_location_granted: bool,
    pub background_location_granted: bool,
    /// Capture time, epoch milliseconds
    pub timestamp: i64,
}

impl DeviceStatusSnapshot {
    /// Read every accessor of `provider` once
    pub fn capture(provider: &dyn DeviceStatusProvider, now_ms: i64) -> Self {
        let info = provider.device_info();
        let battery = provider.battery();
        let network = provider.network();
        let permissions = provider.permissions();

        Self {
            manufacturer: info.manufacturer,
            model: info.model,
            os_version: info.os_version,
            screen_on: provider.screen_on(),
            locked: provider.locked(),
            battery_percent: battery.percent(),
            charging: battery.charging,
            power_save_mode: provider.power_save_mode(),
            has_internet: network.map(|n| n.has_internet).unwrap_or(false),
            network_type: network.map(|n| n.transport).unwrap_or_default(),
            gps_enabled: provider.gps_enabled(),
            fine_location_granted: permissions.fine_location,
            background_location_granted: permissions.background_location,
            timestamp: now_ms,
        }
    }
}

/// Device status served from configuration.
///
/// Used by the host binary and in tests, where there is no platform to query.
#[derive(Debug, Clone)]
pub struct StaticDeviceStatus {
    config: DeviceConfig,
}

impl StaticDeviceStatus {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }
}

impl DeviceStatusProvider for StaticDeviceStatus {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            manufacturer: self.config.manufacturer.clone(),
            model: self.config.model.clone(),
            device: self.config.device.clone(),
            os_version: self.config.os_version.clone(),
        }
    }

    fn screen_on(&self) -> bool {
        self.config.screen_on
    }

    fn locked(&self) -> bool {
        self.config.locked
    }

    fn power_save_mode(&self) -> bool {
        self.config.power_save_mode
    }

    fn battery(&self) -> BatteryReading {
        BatteryReading {
            level: self.config.battery_level,
            scale: 100,
            charging: self.config.charging,
        }
    }

    fn network(&self) -> Option<NetworkInfo> {
        match self.config.network_type {
            NetworkType::None => None,
            transport => Some(NetworkInfo {
                has_internet: self.config.has_internet,
                transport,
            }),
        }
    }

    fn gps_enabled(&self) -> bool {
        self.config.gps_enabled
    }

    fn permissions(&self) -> PermissionStatus {
        PermissionStatus {
            fine_location: self.config.fine_location_granted,
            background_location: self.config.background_location_granted,
        }
    }
}

impl PermissionChecker for StaticDeviceStatus {
    fn has_location_permission(&self) -> bool {
        self.config.fine_location_granted
    }
}
