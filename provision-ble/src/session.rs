//! Session, handshake, and rate-limit state for the BLE GATT server (C6,
//! §4.6). Kept free of any BlueZ/D-Bus dependency so the authentication and
//! credential-decryption logic is unit-testable without real hardware —
//! the same separation `provision_core::reset_monitor` uses for its
//! debounce logic.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use provision_crypto::{CryptoError, CryptoService, NonceTracker};
use provision_proto::ble::{CHALLENGE_LEN, HANDSHAKE_MAC_LEN, PEER_NONCE_LEN};
use provision_proto::credentials::{CredentialFrame, CredentialMessage, FrameError};
use rand::RngCore;
use zeroize::Zeroize;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const RECONNECT_WINDOW: Duration = Duration::from_secs(10);
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const RATE_LIMIT_MAX_FAILURES: u32 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("peer exceeded the failed-write rate limit")]
    RateLimited,
    #[error("no session in progress")]
    NoSession,
    #[error("handshake MAC verification failed")]
    HandshakeFailed,
    #[error("handshake write is the wrong length")]
    MalformedHandshake,
    #[error("credentials write received before a successful handshake")]
    NotAuthenticated,
    #[error("payload looks like plaintext credentials, encryption required")]
    EncryptionRequired,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("decrypted credentials payload is not valid JSON")]
    Malformed,
}

pub struct BleSession {
    pub session_id: [u8; 16],
    pub peer_address: String,
    pub challenge: [u8; CHALLENGE_LEN],
    session_key: [u8; 32],
    pub peer_authenticated: bool,
    pub created_at: Instant,
    pub last_activity: Instant,
    nonces: NonceTracker,
    /// The previous session's `session_id` for this peer, if this session
    /// was opened within `RECONNECT_WINDOW` of that one dropping (§4.6
    /// recovery paragraph). Folded into the HKDF transcript on handshake so
    /// a resumed session's key is bound to the session it replaces.
    resumed_from: Option<[u8; 16]>,
}

/// The tail end of a session that is no longer current, kept just long
/// enough for `begin_session` to recognize a same-peer reconnect within
/// `RECONNECT_WINDOW`.
struct LastSession {
    peer_address: String,
    session_id: [u8; 16],
    at: Instant,
}

impl Drop for BleSession {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

#[derive(Default)]
struct RateWindow {
    window_start: Option<Instant>,
    failures: u32,
}

/// Owns at most one active `BleSession` plus per-peer rate-limit counters.
/// A new connection always invalidates the previous session (§3: "A new
/// connection invalidates any previous session").
pub struct SessionManager {
    crypto: CryptoService,
    pairing_secret: Vec<u8>,
    current: Option<BleSession>,
    last_session: Option<LastSession>,
    rate_limits: HashMap<String, RateWindow>,
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.pairing_secret.zeroize();
    }
}

impl SessionManager {
    pub fn new(pairing_secret: Vec<u8>) -> Self {
        Self {
            crypto: CryptoService::new(),
            pairing_secret,
            current: None,
            last_session: None,
            rate_limits: HashMap::new(),
        }
    }

    pub fn is_rate_limited(&mut self, peer: &str, now: Instant) -> bool {
        let window = self.rate_limits.entry(peer.to_string()).or_default();
        match window.window_start {
            Some(start) if now.duration_since(start) < RATE_LIMIT_WINDOW => window.failures >= RATE_LIMIT_MAX_FAILURES,
            _ => {
                window.window_start = Some(now);
                window.failures = 0;
                false
            }
        }
    }

    pub fn record_failure(&mut self, peer: &str, now: Instant) {
        let window = self.rate_limits.entry(peer.to_string()).or_default();
        if window.window_start.is_none_or(|start| now.duration_since(start) >= RATE_LIMIT_WINDOW) {
            window.window_start = Some(now);
            window.failures = 0;
        }
        window.failures += 1;
    }

    /// Starts a fresh session for a newly connected peer, returning the
    /// challenge the caller must deliver via the `C_HANDSHAKE` notify path.
    ///
    /// A new connection invalidates whatever session was current, but if
    /// the same peer reconnects within `RECONNECT_WINDOW` the outgoing
    /// session's `session_id` is remembered and bound into this one's
    /// handshake transcript (§4.6 recovery paragraph, S-F).
    pub fn begin_session(&mut self, peer_address: &str) -> [u8; CHALLENGE_LEN] {
        let now = Instant::now();
        if let Some(old) = self.current.take() {
            self.last_session = Some(LastSession { peer_address: old.peer_address.clone(), session_id: old.session_id, at: now });
        }

        let resumed_from = self.last_session.as_ref().and_then(|last| {
            (last.peer_address == peer_address && now.duration_since(last.at) < RECONNECT_WINDOW).then_some(last.session_id)
        });

        let mut session_id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut session_id);
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        self.current = Some(BleSession {
            session_id,
            peer_address: peer_address.to_string(),
            challenge,
            session_key: [0u8; 32],
            peer_authenticated: false,
            created_at: now,
            last_activity: now,
            nonces: NonceTracker::new(64),
            resumed_from,
        });
        challenge
    }

    pub fn current_peer(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.peer_address.as_str())
    }

    /// Whether the current session has completed a verified handshake.
    /// `current_peer().is_some()` only proves a session object exists, not
    /// that the peer authenticated it — callers gating privileged actions
    /// (e.g. `FactoryReset`) must use this instead.
    pub fn is_authenticated(&self) -> bool {
        self.current.as_ref().is_some_and(|s| s.peer_authenticated)
    }

    /// Verifies a `peer_nonce(32) || mac(32)` handshake write and, on
    /// success, derives the session key.
    pub fn handshake(&mut self, raw: &[u8]) -> Result<(), SessionError> {
        if raw.len() != PEER_NONCE_LEN + HANDSHAKE_MAC_LEN {
            return Err(SessionError::MalformedHandshake);
        }
        let (peer_nonce, candidate_mac) = raw.split_at(PEER_NONCE_LEN);
        let session = self.current.as_mut().ok_or(SessionError::NoSession)?;
        if !self.crypto.verify_handshake_mac(&self.pairing_secret, &session.challenge, peer_nonce, candidate_mac) {
            return Err(SessionError::HandshakeFailed);
        }
        let mut transcript = Vec::with_capacity(CHALLENGE_LEN + PEER_NONCE_LEN + 16);
        transcript.extend_from_slice(&session.challenge);
        transcript.extend_from_slice(peer_nonce);
        if let Some(prior_id) = session.resumed_from {
            transcript.extend_from_slice(&prior_id);
        }
        session.session_key = self.crypto.derive_session_key(&transcript)?;
        session.peer_authenticated = true;
        session.last_activity = Instant::now();
        // The resumption has now been consumed; a later reconnect within
        // the window should bind to *this* session, not the one before it.
        self.last_session = None;
        Ok(())
    }

    /// Rejects plaintext before decryption is ever attempted (§4.6 step 4),
    /// then decrypts and parses a `C_CREDENTIALS` write.
    pub fn decrypt_credentials(&mut self, raw: &[u8]) -> Result<CredentialMessage, SessionError> {
        if self.crypto.looks_like_plaintext_credentials(raw) {
            return Err(SessionError::EncryptionRequired);
        }
        let session = self.current.as_mut().ok_or(SessionError::NotAuthenticated)?;
        if !session.peer_authenticated {
            return Err(SessionError::NotAuthenticated);
        }
        let frame = CredentialFrame::parse(raw)?;
        session.nonces.observe(frame.nonce)?;
        let plaintext = self.crypto.decrypt_parts(&session.session_key, &frame.nonce, &frame.ciphertext)?;
        session.last_activity = Instant::now();
        let message = CredentialMessage::from_json(&plaintext).map_err(|_| SessionError::Malformed)?;
        Ok(message)
    }

    pub fn touch(&mut self) {
        if let Some(session) = self.current.as_mut() {
            session.last_activity = Instant::now();
        }
    }

    /// Drops the current session. If it belonged to a peer (i.e. it wasn't
    /// already cleared), its `session_id` is kept around so a same-peer
    /// reconnect within `RECONNECT_WINDOW` can resume it.
    pub fn clear_session(&mut self) {
        if let Some(old) = self.current.take() {
            self.last_session = Some(LastSession { peer_address: old.peer_address.clone(), session_id: old.session_id, at: Instant::now() });
        }
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        self.current.as_ref().is_some_and(|s| now.duration_since(s.last_activity) >= IDLE_TIMEOUT)
    }

    /// Clears the session if it has gone idle, returning whether it did.
    pub fn sweep_idle(&mut self, now: Instant) -> bool {
        if self.is_idle(now) {
            self.clear_session();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> Vec<u8> {
        b"pairing-secret-bytes".to_vec()
    }

    #[test]
    fn handshake_succeeds_with_correct_mac() {
        let mut mgr = SessionManager::new(secret());
        let challenge = mgr.begin_session("AA:BB:CC:DD:EE:FF");
        let peer_nonce = [9u8; PEER_NONCE_LEN];
        let crypto = CryptoService::new();
        let mac = crypto.handshake_mac(&secret(), &challenge, &peer_nonce);
        let mut raw = peer_nonce.to_vec();
        raw.extend_from_slice(&mac);
        assert!(mgr.handshake(&raw).is_ok());
    }

    #[test]
    fn handshake_rejects_wrong_mac() {
        let mut mgr = SessionManager::new(secret());
        mgr.begin_session("AA:BB:CC:DD:EE:FF");
        let raw = vec![0u8; PEER_NONCE_LEN + HANDSHAKE_MAC_LEN];
        assert_eq!(mgr.handshake(&raw), Err(SessionError::HandshakeFailed));
    }

    #[test]
    fn credentials_before_handshake_are_rejected() {
        let mut mgr = SessionManager::new(secret());
        mgr.begin_session("AA:BB:CC:DD:EE:FF");
        let ciphertext_like = vec![0xAB; 64];
        assert_eq!(mgr.decrypt_credentials(&ciphertext_like), Err(SessionError::NotAuthenticated));
    }

    #[test]
    fn plaintext_credentials_are_rejected_before_auth_check() {
        let mut mgr = SessionManager::new(secret());
        let result = mgr.decrypt_credentials(b"{\"ssid\":\"Home\",\"password\":\"x\"}");
        assert_eq!(result, Err(SessionError::EncryptionRequired));
    }

    #[test]
    fn full_handshake_then_credential_round_trip() {
        let mut mgr = SessionManager::new(secret());
        let challenge = mgr.begin_session("AA:BB:CC:DD:EE:FF");
        let peer_nonce = [3u8; PEER_NONCE_LEN];
        let crypto = CryptoService::new();
        let mac = crypto.handshake_mac(&secret(), &challenge, &peer_nonce);
        let mut handshake_raw = peer_nonce.to_vec();
        handshake_raw.extend_from_slice(&mac);
        mgr.handshake(&handshake_raw).unwrap();

        let mut transcript = challenge.to_vec();
        transcript.extend_from_slice(&peer_nonce);
        let session_key = crypto.derive_session_key(&transcript).unwrap();
        let payload = crypto.encrypt(&session_key, b"{\"ssid\":\"Home\",\"password\":\"goodpass123\",\"security\":\"WPA2\"}").unwrap();
        let frame = CredentialFrame::encode(provision_proto::ble::PROTOCOL_VERSION, &payload[..12].try_into().unwrap(), &payload[12..]);

        let message = mgr.decrypt_credentials(&frame).unwrap();
        assert_eq!(message.ssid, "Home");
    }

    #[test]
    fn rate_limit_trips_after_max_failures_within_window() {
        let mut mgr = SessionManager::new(secret());
        let now = Instant::now();
        for _ in 0..RATE_LIMIT_MAX_FAILURES {
            mgr.record_failure("peer", now);
        }
        assert!(mgr.is_rate_limited("peer", now));
    }

    #[test]
    fn rate_limit_window_resets_after_expiry() {
        let mut mgr = SessionManager::new(secret());
        let now = Instant::now();
        for _ in 0..RATE_LIMIT_MAX_FAILURES {
            mgr.record_failure("peer", now);
        }
        let later = now + RATE_LIMIT_WINDOW + Duration::from_secs(1);
        assert!(!mgr.is_rate_limited("peer", later));
    }

    #[test]
    fn idle_session_is_swept() {
        let mut mgr = SessionManager::new(secret());
        mgr.begin_session("AA:BB:CC:DD:EE:FF");
        let later = Instant::now() + IDLE_TIMEOUT + Duration::from_secs(1);
        assert!(mgr.sweep_idle(later));
        assert!(mgr.current_peer().is_none());
    }

    fn handshake_raw(crypto: &CryptoService, challenge: &[u8; CHALLENGE_LEN], peer_nonce: &[u8; PEER_NONCE_LEN]) -> Vec<u8> {
        let mac = crypto.handshake_mac(&secret(), challenge, peer_nonce);
        let mut raw = peer_nonce.to_vec();
        raw.extend_from_slice(&mac);
        raw
    }

    #[test]
    fn reconnect_within_window_resumes_and_binds_prior_session_id() {
        let mut mgr = SessionManager::new(secret());
        let crypto = CryptoService::new();

        let challenge1 = mgr.begin_session("AA:BB:CC:DD:EE:FF");
        let first_session_id = mgr.current.as_ref().unwrap().session_id;
        mgr.clear_session(); // transport dropped mid-exchange

        let challenge2 = mgr.begin_session("AA:BB:CC:DD:EE:FF");
        assert_eq!(mgr.current.as_ref().unwrap().resumed_from, Some(first_session_id));
        assert_ne!(challenge1, challenge2);

        let peer_nonce = [7u8; PEER_NONCE_LEN];
        let raw = handshake_raw(&crypto, &challenge2, &peer_nonce);
        mgr.handshake(&raw).unwrap();

        // The resumption was consumed by the successful handshake; a peer
        // reconnecting again now resumes off *this* session, not the first.
        let second_session_id = mgr.current.as_ref().unwrap().session_id;
        mgr.begin_session("AA:BB:CC:DD:EE:FF");
        assert_eq!(mgr.current.as_ref().unwrap().resumed_from, Some(second_session_id));
    }

    #[test]
    fn reconnect_after_window_does_not_resume() {
        let mut mgr = SessionManager::new(secret());
        mgr.begin_session("AA:BB:CC:DD:EE:FF");
        mgr.clear_session();
        if let Some(last) = mgr.last_session.as_mut() {
            last.at = Instant::now() - RECONNECT_WINDOW - Duration::from_secs(1);
        }
        mgr.begin_session("AA:BB:CC:DD:EE:FF");
        assert!(mgr.current.as_ref().unwrap().resumed_from.is_none());
    }

    #[test]
    fn reconnect_from_a_different_peer_does_not_resume() {
        let mut mgr = SessionManager::new(secret());
        mgr.begin_session("AA:BB:CC:DD:EE:FF");
        mgr.clear_session();
        mgr.begin_session("11:22:33:44:55:66");
        assert!(mgr.current.as_ref().unwrap().resumed_from.is_none());
    }
}
