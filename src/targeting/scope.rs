//! Binding scopes: the whole fleet, or one device.

use serde::{Serialize, Serializer};
use std::str::FromStr;

use crate::error::{FirmwareError, Result};

const GLOBAL: &str = "global";
const DEVICE_KEY_PREFIX: &str = "device:";
const MAX_DEVICE_ID_LEN: usize = 128;

/// A validated device identifier: 1-128 chars of `[A-Za-z0-9._:-]`,
/// never the reserved word `global`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FirmwareError::Validation("device id must not be empty".into()));
        }
        if raw.len() > MAX_DEVICE_ID_LEN {
            return Err(FirmwareError::Validation(format!(
                "device id must be at most {} characters",
                MAX_DEVICE_ID_LEN
            )));
        }
        if raw.eq_ignore_ascii_case(GLOBAL) {
            return Err(FirmwareError::Validation(
                "'global' is reserved and cannot be used as a device id".into(),
            ));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
        {
            return Err(FirmwareError::Validation(format!(
                "device id contains invalid character {:?}",
                bad
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = FirmwareError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Target of a binding. A device binding overrides the global one for that
/// device only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Global,
    Device(DeviceId),
}

impl Scope {
    pub fn for_device(device: Option<DeviceId>) -> Self {
        device.map_or(Scope::Global, Scope::Device)
    }

    /// Parse the form used in URLs: `global` or a device id
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().eq_ignore_ascii_case(GLOBAL) {
            Ok(Scope::Global)
        } else {
            DeviceId::parse(raw).map(Scope::Device)
        }
    }

    /// Key under which the catalog stores this scope
    pub fn storage_key(&self) -> String {
        match self {
            Scope::Global => GLOBAL.to_string(),
            Scope::Device(id) => format!("{}{}", DEVICE_KEY_PREFIX, id),
        }
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        if key == GLOBAL {
            return Some(Scope::Global);
        }
        key.strip_prefix(DEVICE_KEY_PREFIX)
            .and_then(|id| DeviceId::parse(id).ok())
            .map(Scope::Device)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => f.write_str(GLOBAL),
            Scope::Device(id) => write!(f, "{}", id),
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_validation() {
        assert!(DeviceId::parse("sensor-7").is_ok());
        assert!(DeviceId::parse("aa:bb:cc:dd:ee:ff").is_ok());
        assert_eq!(DeviceId::parse("  sensor-7 ").unwrap().as_str(), "sensor-7");

        assert!(DeviceId::parse("").is_err());
        assert!(DeviceId::parse("GLOBAL").is_err());
        assert!(DeviceId::parse("../etc/passwd").is_err());
        assert!(DeviceId::parse("sensor 7").is_err());
        assert!(DeviceId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(Scope::parse("global").unwrap(), Scope::Global);
        assert_eq!(Scope::parse("Global").unwrap(), Scope::Global);
        assert_eq!(
            Scope::parse("sensor-9").unwrap(),
            Scope::Device(DeviceId::parse("sensor-9").unwrap())
        );
    }

    #[test]
    fn test_storage_keys() {
        let device = Scope::Device(DeviceId::parse("sensor-7").unwrap());
        assert_eq!(device.storage_key(), "device:sensor-7");
        assert_eq!(Scope::from_storage_key("device:sensor-7"), Some(device));
        assert_eq!(Scope::from_storage_key("global"), Some(Scope::Global));
        assert_eq!(Scope::from_storage_key("sensor-7"), None);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let device = Scope::Device(DeviceId::parse("sensor-7").unwrap());
        assert_eq!(serde_json::to_string(&device).unwrap(), "\"sensor-7\"");
        assert_eq!(serde_json::to_string(&Scope::Global).unwrap(), "\"global\"");
    }
}
