//! Ownership Service (C3): single-owner registration, PIN authentication,
//! failed-attempt tracking, lockout. Internally single-threaded: every
//! operation takes `&self.inner` through one mutex, so counter/persist
//! ordering is never racy.

use std::sync::Mutex;
use std::sync::Arc;

use provision_crypto::CryptoService;

use crate::records::{now_unix, LockoutState, OwnerRecord};
use crate::store::{ConfigStore, StorageError};
use crate::validator::{self, ValidationError};

#[derive(Debug, Clone, Copy)]
pub struct OwnershipConfig {
    pub max_attempts: u32,
    pub lockout_duration_secs: u64,
    pub setup_timeout_secs: u64,
    pub owner_required: bool,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lockout_duration_secs: 3600,
            setup_timeout_secs: 600,
            owner_required: true,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("an owner is already registered")]
    AlreadyRegistered,
    #[error("owner setup window has expired or was never opened")]
    SetupWindowExpired,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for OwnershipError {
    fn from(e: StorageError) -> Self {
        OwnershipError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    InvalidPin { attempts_remaining: u32 },
    LockedOut { retry_after_secs: u64 },
    NoOwner,
}

struct Inner {
    setup_deadline: Option<u64>,
}

/// Owner registration, PIN authentication, and lockout bookkeeping (§4.3).
pub struct OwnershipService {
    store: Arc<ConfigStore>,
    crypto: CryptoService,
    config: OwnershipConfig,
    inner: Mutex<Inner>,
}

impl OwnershipService {
    pub fn new(store: Arc<ConfigStore>, config: OwnershipConfig) -> Self {
        Self {
            store,
            crypto: CryptoService::new(),
            config,
            inner: Mutex::new(Inner { setup_deadline: None }),
        }
    }

    /// Whether this deployment requires an owner to be registered before
    /// provisioning can proceed. A pure configuration read, independent of
    /// whether a record currently exists.
    pub fn owner_required(&self) -> bool {
        self.config.owner_required
    }

    pub fn has_owner(&self) -> bool {
        self.store.load_owner().is_some()
    }

    /// Opens the registration window; `register()` fails once
    /// `setup_timeout_secs` has elapsed since this call.
    pub fn begin_setup(&self) {
        let mut inner = self.inner.lock().expect("ownership mutex poisoned");
        inner.setup_deadline = Some(now_unix() + self.config.setup_timeout_secs);
    }

    pub fn register(&self, owner_name: &str, pin: &str, device_id: &str) -> Result<(), OwnershipError> {
        if self.has_owner() {
            return Err(OwnershipError::AlreadyRegistered);
        }
        {
            let inner = self.inner.lock().expect("ownership mutex poisoned");
            match inner.setup_deadline {
                Some(deadline) if now_unix() <= deadline => {}
                _ => return Err(OwnershipError::SetupWindowExpired),
            }
        }
        validator::validate_owner_name(owner_name)?;
        validator::validate_pin(pin)?;

        let pin_hash = self
            .crypto
            .hash_pin(pin)
            .map_err(|e| OwnershipError::Storage(e.to_string()))?;
        let record = OwnerRecord::new(owner_name.to_string(), pin_hash, device_id.to_string());
        self.store.store_owner(&record)?;
        Ok(())
    }

    /// Authenticate `pin` against the registered owner, applying and
    /// persisting lockout state before returning (§4.3 invariant: a crash
    /// between the compare and the persist must never lose the lockout).
    pub fn authenticate(&self, pin: &str) -> Result<AuthResult, OwnershipError> {
        let Some(owner) = self.store.load_owner() else {
            return Ok(AuthResult::NoOwner);
        };
        let now = now_unix();
        let mut lockout = self.store.load_lockout().unwrap_or_default();
        if lockout.is_locked(now) {
            return Ok(AuthResult::LockedOut {
                retry_after_secs: lockout.locked_until - now,
            });
        }

        let matches = self
            .crypto
            .verify_pin(pin, &owner.pin_hash)
            .map_err(|e| OwnershipError::Storage(e.to_string()))?;

        if matches {
            if lockout.failed_attempts != 0 || lockout.locked_until != 0 {
                lockout = LockoutState::default();
                self.store.store_lockout(&lockout)?;
            }
            return Ok(AuthResult::Success);
        }

        lockout.failed_attempts += 1;
        let result = if lockout.failed_attempts >= self.config.max_attempts {
            lockout.locked_until = now + self.config.lockout_duration_secs;
            AuthResult::LockedOut {
                retry_after_secs: self.config.lockout_duration_secs,
            }
        } else {
            AuthResult::InvalidPin {
                attempts_remaining: self.config.max_attempts - lockout.failed_attempts,
            }
        };
        self.store.store_lockout(&lockout)?;
        Ok(result)
    }

    /// Erases the owner record and lockout state. Only the factory-reset
    /// path may call this.
    pub fn clear_owner(&self) -> Result<(), OwnershipError> {
        self.store.clear_owner()?;
        let mut inner = self.inner.lock().expect("ownership mutex poisoned");
        inner.setup_deadline = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc_with(dir: &std::path::Path, config: OwnershipConfig) -> OwnershipService {
        let store = Arc::new(ConfigStore::open(dir).unwrap());
        OwnershipService::new(store, config)
    }

    #[test]
    fn register_requires_open_setup_window() {
        let dir = tempfile::tempdir().unwrap();
        let svc = svc_with(dir.path(), OwnershipConfig::default());
        let err = svc.register("Alice", "57392", "dev-1").unwrap_err();
        assert_eq!(err, OwnershipError::SetupWindowExpired);
    }

    #[test]
    fn register_then_duplicate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let svc = svc_with(dir.path(), OwnershipConfig::default());
        svc.begin_setup();
        svc.register("Alice", "57392", "dev-1").unwrap();
        let err = svc.register("Bob", "84210", "dev-1").unwrap_err();
        assert_eq!(err, OwnershipError::AlreadyRegistered);
    }

    #[test]
    fn register_rejects_invalid_pin() {
        let dir = tempfile::tempdir().unwrap();
        let svc = svc_with(dir.path(), OwnershipConfig::default());
        svc.begin_setup();
        let err = svc.register("Alice", "1234", "dev-1").unwrap_err();
        assert!(matches!(err, OwnershipError::Validation(_)));
    }

    #[test]
    fn authenticate_success_resets_counters() {
        let dir = tempfile::tempdir().unwrap();
        let svc = svc_with(dir.path(), OwnershipConfig::default());
        svc.begin_setup();
        svc.register("Alice", "57392", "dev-1").unwrap();
        assert_eq!(svc.authenticate("57392").unwrap(), AuthResult::Success);
    }

    #[test]
    fn authenticate_locks_out_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let config = OwnershipConfig {
            max_attempts: 2,
            ..OwnershipConfig::default()
        };
        let svc = svc_with(dir.path(), config);
        svc.begin_setup();
        svc.register("Alice", "57392", "dev-1").unwrap();

        let first = svc.authenticate("00000").unwrap();
        assert_eq!(first, AuthResult::InvalidPin { attempts_remaining: 1 });

        let second = svc.authenticate("00000").unwrap();
        assert!(matches!(second, AuthResult::LockedOut { .. }));

        let third = svc.authenticate("57392").unwrap();
        assert!(matches!(third, AuthResult::LockedOut { .. }), "locked out even with the right pin");
    }

    #[test]
    fn clear_owner_allows_fresh_registration() {
        let dir = tempfile::tempdir().unwrap();
        let svc = svc_with(dir.path(), OwnershipConfig::default());
        svc.begin_setup();
        svc.register("Alice", "57392", "dev-1").unwrap();
        svc.clear_owner().unwrap();
        assert!(!svc.has_owner());

        svc.begin_setup();
        svc.register("Bob", "84210", "dev-1").unwrap();
        assert!(svc.has_owner());
    }

    #[test]
    fn authenticate_without_owner_reports_no_owner() {
        let dir = tempfile::tempdir().unwrap();
        let svc = svc_with(dir.path(), OwnershipConfig::default());
        assert_eq!(svc.authenticate("57392").unwrap(), AuthResult::NoOwner);
    }
}
