//! Config Store (C1): atomic on-disk persistence for `OwnerRecord`,
//! `WifiProfile`, `LockoutState`, and the generated-`device_id` fallback.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::records::{LockoutState, OwnerRecord, Versioned, WifiProfile, SCHEMA_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

const OWNER_FILE: &str = "owner.json";
const WIFI_FILE: &str = "wifi.json";
const LOCKOUT_FILE: &str = "lockout.json";
const DEVICE_ID_FILE: &str = "device_id";

const MODE_SECRET: u32 = 0o600;
const MODE_PROFILE: u32 = 0o644;
const MODE_DIR: u32 = 0o700;

/// Durable key/value persistence rooted at a single directory (§4.1, §6.2).
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    /// Open (creating if absent) the configuration root, setting its mode to
    /// `0700` and owned by the running service user.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io { path: root.clone(), source })?;
        set_mode(&root, MODE_DIR)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load_owner(&self) -> Option<OwnerRecord> {
        self.load_record(OWNER_FILE)
    }

    pub fn store_owner(&self, record: &OwnerRecord) -> Result<(), StorageError> {
        self.store_record(OWNER_FILE, record, MODE_SECRET)
    }

    pub fn load_wifi(&self) -> Option<WifiProfile> {
        self.load_record(WIFI_FILE)
    }

    pub fn store_wifi(&self, record: &WifiProfile) -> Result<(), StorageError> {
        self.store_record(WIFI_FILE, record, MODE_PROFILE)
    }

    pub fn load_lockout(&self) -> Option<LockoutState> {
        self.load_record(LOCKOUT_FILE)
    }

    pub fn store_lockout(&self, record: &LockoutState) -> Result<(), StorageError> {
        self.store_record(LOCKOUT_FILE, record, MODE_SECRET)
    }

    /// Loaded only as a fallback when no machine-id / DMI product UUID is
    /// available; see `identity::resolve_device_id`.
    pub fn load_device_id_override(&self) -> Option<String> {
        let path = self.root.join(DEVICE_ID_FILE);
        fs::read_to_string(&path).ok().map(|s| s.trim().to_string())
    }

    pub fn store_device_id_override(&self, device_id: &str) -> Result<(), StorageError> {
        let path = self.root.join(DEVICE_ID_FILE);
        atomic_write(&path, device_id.as_bytes(), MODE_SECRET)
    }

    /// Removes every persisted record, including the device-id override file.
    /// Used by the factory-reset path. Idempotent: a missing file is not an error.
    pub fn clear_all(&self) -> Result<(), StorageError> {
        for name in [OWNER_FILE, WIFI_FILE, LOCKOUT_FILE, DEVICE_ID_FILE] {
            self.remove_if_present(name)?;
        }
        info!("config store cleared");
        Ok(())
    }

    /// Removes only `owner.json` and `lockout.json`. Used by the Ownership
    /// Service's `clear_owner()`, which leaves any saved Wi-Fi profile and
    /// device-id override untouched.
    pub fn clear_owner(&self) -> Result<(), StorageError> {
        self.remove_if_present(OWNER_FILE)?;
        self.remove_if_present(LOCKOUT_FILE)?;
        info!("owner record and lockout state cleared");
        Ok(())
    }

    fn remove_if_present(&self, name: &str) -> Result<(), StorageError> {
        let path = self.root.join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn load_record<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.root.join(name);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice::<Versioned<T>>(&bytes) {
            Ok(v) if v.version == SCHEMA_VERSION => Some(v.data),
            Ok(v) => {
                warn!(path = %path.display(), found = v.version, expected = SCHEMA_VERSION, "schema mismatch, quarantining");
                self.quarantine(&path);
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed record, quarantining");
                self.quarantine(&path);
                None
            }
        }
    }

    fn store_record<T: Serialize>(&self, name: &str, record: &T, mode: u32) -> Result<(), StorageError> {
        let path = self.root.join(name);
        let wrapped = Versioned::wrap(record);
        let bytes = serde_json::to_vec_pretty(&wrapped)?;
        atomic_write(&path, &bytes, mode)
    }

    fn quarantine(&self, path: &Path) {
        let mut corrupt = path.to_path_buf();
        corrupt.set_extension("corrupt");
        let _ = fs::rename(path, &corrupt);
    }
}

/// Write-temp-then-rename with an fsync of both the file and its parent
/// directory, so a crash mid-write can never leave a half-written record in
/// place of the previous good one (§4.1).
fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> Result<(), StorageError> {
    let dir = path.parent().expect("record path always has a parent");
    let tmp_name = format!(".{}.tmp", path.file_name().unwrap().to_string_lossy());
    let tmp_path = dir.join(tmp_name);

    let file = fs::File::create(&tmp_path).map_err(|source| StorageError::Io { path: tmp_path.clone(), source })?;
    {
        use std::io::Write;
        let mut file = file;
        file.write_all(bytes).map_err(|source| StorageError::Io { path: tmp_path.clone(), source })?;
        file.sync_all().map_err(|source| StorageError::Io { path: tmp_path.clone(), source })?;
    }
    set_mode(&tmp_path, mode)?;

    fs::rename(&tmp_path, path).map_err(|source| StorageError::Io { path: path.to_path_buf(), source })?;

    if let Ok(dir_file) = fs::File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| StorageError::Io { path: path.to_path_buf(), source })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), StorageError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_owner_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let owner = OwnerRecord::new("Alice".into(), "ab:cd".into(), "dev-1".into());
        store.store_owner(&owner).unwrap();
        let loaded = store.load_owner().unwrap();
        assert_eq!(loaded.owner_name, "Alice");
        assert_eq!(loaded.device_id, "dev-1");
    }

    #[test]
    fn missing_record_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        assert!(store.load_owner().is_none());
        assert!(store.load_wifi().is_none());
    }

    #[test]
    fn malformed_record_is_quarantined_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join(OWNER_FILE), b"not json").unwrap();
        assert!(store.load_owner().is_none());
        assert!(dir.path().join("owner.corrupt").exists());
    }

    #[test]
    fn owner_file_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        store.store_owner(&OwnerRecord::new("Bob".into(), "x:y".into(), "d".into())).unwrap();
        let meta = std::fs::metadata(dir.path().join(OWNER_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, MODE_SECRET);
    }

    #[test]
    fn clear_all_removes_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        store.store_owner(&OwnerRecord::new("A".into(), "x:y".into(), "d".into())).unwrap();
        store.store_wifi(&WifiProfile::new("ssid".into(), "password".into(), SecurityType::Wpa2)).unwrap();
        store.clear_all().unwrap();
        assert!(store.load_owner().is_none());
        assert!(store.load_wifi().is_none());
    }

    use crate::records::SecurityType;

    #[test]
    fn clear_all_is_idempotent_on_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        store.clear_all().unwrap();
        store.clear_all().unwrap();
    }
}
