//! `DeviceIdentity` resolution (§3): a stable 128-bit device id, resolved in
//! priority order from system machine-id, DMI product UUID, a hash of the
//! primary MAC, or finally a freshly generated id persisted to disk.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::records::DeviceIdentity;
use crate::store::ConfigStore;

/// Where to look for system identifiers. A plain struct (rather than a
/// trait) because the paths, not the lookup behavior, are what tests need to
/// swap out.
pub struct IdentitySources {
    pub machine_id_path: PathBuf,
    pub dmi_product_uuid_path: PathBuf,
    pub sys_class_net_path: PathBuf,
}

impl Default for IdentitySources {
    fn default() -> Self {
        Self {
            machine_id_path: PathBuf::from("/etc/machine-id"),
            dmi_product_uuid_path: PathBuf::from("/sys/class/dmi/id/product_uuid"),
            sys_class_net_path: PathBuf::from("/sys/class/net"),
        }
    }
}

/// Resolve the full `DeviceIdentity`, consulting `store` only if every
/// system-level source is unavailable.
pub fn resolve(store: &ConfigStore, sources: &IdentitySources) -> DeviceIdentity {
    let mac_address = resolve_mac_address(sources).unwrap_or_else(|| "00:00:00:00:00:00".to_string());
    let device_id = resolve_device_id(store, sources, &mac_address);
    DeviceIdentity::new(device_id, mac_address)
}

fn resolve_device_id(store: &ConfigStore, sources: &IdentitySources, mac_address: &str) -> String {
    if let Some(id) = read_trimmed(&sources.machine_id_path) {
        if !id.is_empty() {
            debug!("device id resolved from machine-id");
            return id;
        }
    }
    if let Some(id) = read_trimmed(&sources.dmi_product_uuid_path) {
        if !id.is_empty() {
            debug!("device id resolved from DMI product UUID");
            return id.to_lowercase();
        }
    }
    if mac_address != "00:00:00:00:00:00" {
        debug!("device id resolved from SHA-256(MAC)");
        return sha256_hex(mac_address.as_bytes());
    }
    if let Some(id) = store.load_device_id_override() {
        debug!("device id resolved from persisted override");
        return id;
    }
    let id = uuid::Uuid::new_v4().to_string();
    info!(device_id = %id, "generated fresh device id, persisting for future boots");
    // A write failure here is not fatal to startup: this id is still valid
    // for the current process lifetime, it just won't survive a reboot.
    let _ = store.store_device_id_override(&id);
    id
}

fn resolve_mac_address(sources: &IdentitySources) -> Option<String> {
    let entries = fs::read_dir(&sources.sys_class_net_path).ok()?;
    let mut candidates: Vec<(String, String)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "lo" {
            continue;
        }
        let addr_path = entry.path().join("address");
        if let Some(addr) = read_trimmed(&addr_path) {
            if !addr.is_empty() && addr != "00:00:00:00:00:00" {
                candidates.push((name, addr));
            }
        }
    }
    // Prefer a wireless-looking interface name, matching the "primary
    // wireless interface" requirement; fall back to whatever was found.
    candidates
        .iter()
        .find(|(name, _)| name.starts_with("wl"))
        .or_else(|| candidates.first())
        .map(|(_, addr)| canonical_mac(addr))
}

fn canonical_mac(addr: &str) -> String {
    addr.to_lowercase()
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    data_encoding::HEXLOWER.encode(&digest)
}
