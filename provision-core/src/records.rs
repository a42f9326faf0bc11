//! Persisted and transient data-model types (§3).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use provision_proto::SecurityType;

/// Immutable device identity, resolved once at startup (§3, §3a).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub mac_address: String,
    pub qr_payload: String,
}

impl DeviceIdentity {
    pub fn new(device_id: String, mac_address: String) -> Self {
        let mac_no_colons: String = mac_address.chars().filter(|c| *c != ':').collect();
        let qr_payload = format!("ROCKPI:{device_id}:{mac_no_colons}");
        Self {
            device_id,
            mac_address,
            qr_payload,
        }
    }
}

/// Current schema version for every persisted record file (§6.2).
pub const SCHEMA_VERSION: u32 = 1;

/// Owner registration record, persisted to `owner.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub owner_name: String,
    /// `"<salt_hex>:<hash_hex>"`, produced by `provision_crypto::CryptoService::hash_pin`.
    pub pin_hash: String,
    pub registered_at: u64,
    pub device_id: String,
}

impl OwnerRecord {
    pub fn new(owner_name: String, pin_hash: String, device_id: String) -> Self {
        Self {
            owner_name,
            pin_hash,
            registered_at: now_unix(),
            device_id,
        }
    }
}

/// Failed-attempt / lockout counters, persisted to `lockout.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LockoutState {
    pub failed_attempts: u32,
    /// Unix timestamp; lockout active iff `now < locked_until`. `0` means "never".
    pub locked_until: u64,
}

impl LockoutState {
    pub fn is_locked(&self, now: u64) -> bool {
        now < self.locked_until
    }
}

/// Wi-Fi profile, persisted to `wifi.json` only after a verified connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiProfile {
    pub ssid: String,
    pub password: String,
    pub security_type: SecurityType,
    pub saved_at: u64,
}

impl WifiProfile {
    pub fn new(ssid: String, password: String, security_type: SecurityType) -> Self {
        Self {
            ssid,
            password,
            security_type,
            saved_at: now_unix(),
        }
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// Wraps a record with the schema `version` field required by §6.2, so every
/// persisted file is `{"version": N, ...fields}` and loaders can reject a
/// mismatched version before trusting the rest of the document.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Versioned<T> {
    pub version: u32,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Versioned<T> {
    pub fn wrap(data: T) -> Self {
        Self {
            version: SCHEMA_VERSION,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_payload_strips_mac_colons() {
        let id = DeviceIdentity::new("abc123".into(), "AA:BB:CC:DD:EE:FF".into());
        assert_eq!(id.qr_payload, "ROCKPI:abc123:AABBCCDDEEFF");
    }

    #[test]
    fn lockout_is_active_strictly_before_deadline() {
        let l = LockoutState {
            failed_attempts: 3,
            locked_until: 100,
        };
        assert!(l.is_locked(99));
        assert!(!l.is_locked(100));
        assert!(!l.is_locked(101));
    }
}
