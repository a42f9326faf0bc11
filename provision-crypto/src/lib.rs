//! Crypto Service (C2): session key derivation, authenticated encryption of
//! BLE payloads, PIN hashing, and the plaintext-credential heuristic.
//!
//! No key material is ever written to disk by this crate; callers own the
//! lifetime of any buffer passed in or returned and are responsible for
//! zeroising it once done (this crate zeroises its own intermediates).

use std::collections::HashSet;

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const PBKDF2_SALT_LEN: usize = 16;

/// Minimum Shannon entropy, in bits/byte, below which a payload is treated
/// as suspiciously structured (i.e. plaintext) rather than ciphertext.
const ENTROPY_THRESHOLD_BITS_PER_BYTE: f64 = 3.5;
const ENTROPY_MIN_SAMPLE: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext too short to contain a nonce")]
    CiphertextTooShort,
    #[error("authentication tag mismatch")]
    AuthTagMismatch,
    #[error("nonce already used with this session key")]
    NonceReused,
    #[error("key derivation failed")]
    KeyDerivationFailed,
    #[error("salt generation produced insufficient entropy")]
    WeakEntropy,
    #[error("stored PIN hash has an invalid format")]
    MalformedHash,
}

type HmacSha256 = Hmac<Sha256>;

/// Stateless cryptographic operations used by the BLE handshake and
/// credential exchange. Cheap to construct; holds no secret state itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptoService;

impl CryptoService {
    pub fn new() -> Self {
        Self
    }

    /// Derive a 256-bit session key via HKDF-SHA256 over the handshake
    /// transcript (`challenge || peer_nonce`, per the wire protocol).
    /// Deterministic given the same input.
    pub fn derive_session_key(&self, shared_handshake_material: &[u8]) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, shared_handshake_material);
        let mut okm = [0u8; SESSION_KEY_LEN];
        hk.expand(b"rockpi-provisioning-session-key", &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(okm)
    }

    /// Compute HMAC-SHA256(pairing_secret, challenge || peer_nonce), used by
    /// the client side of `C_HANDSHAKE` and verified by the server.
    pub fn handshake_mac(&self, pairing_secret: &[u8], challenge: &[u8], peer_nonce: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(pairing_secret).expect("HMAC accepts any key length");
        mac.update(challenge);
        mac.update(peer_nonce);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time verification of a client-supplied handshake MAC.
    pub fn verify_handshake_mac(&self, pairing_secret: &[u8], challenge: &[u8], peer_nonce: &[u8], candidate: &[u8]) -> bool {
        let expected = self.handshake_mac(pairing_secret, challenge, peer_nonce);
        expected.ct_eq(candidate).into()
    }

    /// Authenticated-encrypt `plaintext` under `session_key`. Returns
    /// `nonce(12) || ct_and_tag(...)`. The nonce is drawn fresh from the OS
    /// CSPRNG on every call, making reuse under the same key negligible.
    pub fn encrypt(&self, session_key: &[u8; SESSION_KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt a `nonce(12) || ct_and_tag(...)` buffer produced by `encrypt`.
    /// Any authentication failure, regardless of cause, is reported as
    /// `AuthTagMismatch` so the caller cannot distinguish tampering from
    /// corruption (an oracle would leak information to an attacker).
    pub fn decrypt(&self, session_key: &[u8; SESSION_KEY_LEN], nonce_and_ct: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce_and_ct.len() < NONCE_LEN {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (nonce_bytes, ct) = nonce_and_ct.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key));
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher.decrypt(nonce, ct).map_err(|_| CryptoError::AuthTagMismatch)
    }

    /// Decrypt a pre-split `(nonce, ciphertext)` pair, as produced by parsing
    /// a `CredentialFrame`.
    pub fn decrypt_parts(&self, session_key: &[u8; SESSION_KEY_LEN], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthTagMismatch)
    }

    /// Hash a PIN for storage: `PBKDF2-HMAC-SHA256`, >=100_000 iterations,
    /// a fresh >=16-byte random salt. Returns `"<salt_hex>:<hash_hex>"`.
    pub fn hash_pin(&self, pin: &str) -> Result<String, CryptoError> {
        let mut salt = [0u8; PBKDF2_SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        if salt.iter().all(|b| *b == 0) {
            return Err(CryptoError::WeakEntropy);
        }
        let mut hash = [0u8; 32];
        pbkdf2_hmac::<Sha256>(pin.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut hash);
        let encoded = format!(
            "{}:{}",
            data_encoding::HEXLOWER.encode(&salt),
            data_encoding::HEXLOWER.encode(&hash)
        );
        hash.zeroize();
        Ok(encoded)
    }

    /// Verify `pin` against a `"<salt_hex>:<hash_hex>"` record produced by
    /// `hash_pin`, in constant time.
    pub fn verify_pin(&self, pin: &str, stored: &str) -> Result<bool, CryptoError> {
        let (salt_hex, hash_hex) = stored.split_once(':').ok_or(CryptoError::MalformedHash)?;
        let salt = data_encoding::HEXLOWER
            .decode(salt_hex.as_bytes())
            .map_err(|_| CryptoError::MalformedHash)?;
        let expected = data_encoding::HEXLOWER
            .decode(hash_hex.as_bytes())
            .map_err(|_| CryptoError::MalformedHash)?;

        let mut candidate = vec![0u8; expected.len()];
        pbkdf2_hmac::<Sha256>(pin.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut candidate);
        let matches: bool = candidate.ct_eq(&expected).into();
        candidate.zeroize();
        Ok(matches)
    }

    /// Conservative heuristic run on the *raw* inbound `C_CREDENTIALS`
    /// bytes, before any decryption is attempted. A `true` result means the
    /// server must reject the write with `EncryptionRequired` without ever
    /// calling `decrypt`.
    pub fn looks_like_plaintext_credentials(&self, bytes: &[u8]) -> bool {
        if contains_cleartext_marker(bytes) {
            return true;
        }
        shannon_entropy_bits_per_byte(bytes)
            .map(|bits| bytes.len() >= ENTROPY_MIN_SAMPLE && bits < ENTROPY_THRESHOLD_BITS_PER_BYTE)
            .unwrap_or(false)
    }
}

const CLEARTEXT_MARKERS: &[&[u8]] = &[
    b"SSID=",
    b"password=",
    b"PSK=",
    b"\"ssid\"",
    b"\"password\"",
    b"-----BEGIN ",
    b"PRIVATE KEY",
];

fn contains_cleartext_marker(bytes: &[u8]) -> bool {
    CLEARTEXT_MARKERS.iter().any(|marker| contains_subslice(bytes, marker))
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn shannon_entropy_bits_per_byte(bytes: &[u8]) -> Option<f64> {
    if bytes.is_empty() {
        return None;
    }
    let mut counts = [0u32; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    let len = bytes.len() as f64;
    let entropy = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum();
    Some(entropy)
}

/// Tracks recently-seen handshake/credential nonces for a single BLE
/// session so a replayed ciphertext can be rejected with `NonceReused`
/// instead of being handed to the AEAD a second time. Bounded so a
/// misbehaving peer cannot grow it without limit.
#[derive(Debug, Default)]
pub struct NonceTracker {
    seen: HashSet<[u8; NONCE_LEN]>,
    capacity: usize,
}

impl NonceTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Records `nonce` as used. Returns `Err(NonceReused)` if it was already
    /// present, without mutating the tracker.
    pub fn observe(&mut self, nonce: [u8; NONCE_LEN]) -> Result<(), CryptoError> {
        if self.seen.contains(&nonce) {
            return Err(CryptoError::NonceReused);
        }
        if self.seen.len() >= self.capacity {
            // Bounded memory: drop the tracker rather than grow unboundedly.
            // A resumed session starts a fresh tracker anyway (see BleSession).
            self.seen.clear();
        }
        self.seen.insert(nonce);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trips() {
        let svc = CryptoService::new();
        let key = [42u8; SESSION_KEY_LEN];
        let pt = b"hello rockpi";
        let ct = svc.encrypt(&key, pt).unwrap();
        let back = svc.decrypt(&key, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let svc = CryptoService::new();
        let key = [7u8; SESSION_KEY_LEN];
        let mut ct = svc.encrypt(&key, b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert_eq!(svc.decrypt(&key, &ct), Err(CryptoError::AuthTagMismatch));
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let svc = CryptoService::new();
        let ct = svc.encrypt(&[1u8; SESSION_KEY_LEN], b"payload").unwrap();
        assert_eq!(svc.decrypt(&[2u8; SESSION_KEY_LEN], &ct), Err(CryptoError::AuthTagMismatch));
    }

    #[test]
    fn hash_pin_then_verify_same_is_true_other_is_false() {
        let svc = CryptoService::new();
        let stored = svc.hash_pin("574829").unwrap();
        assert!(svc.verify_pin("574829", &stored).unwrap());
        assert!(!svc.verify_pin("000000", &stored).unwrap());
    }

    #[test]
    fn derive_session_key_is_deterministic() {
        let svc = CryptoService::new();
        let a = svc.derive_session_key(b"challenge-and-nonce").unwrap();
        let b = svc.derive_session_key(b"challenge-and-nonce").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn handshake_mac_round_trips() {
        let svc = CryptoService::new();
        let secret = b"pairing-secret";
        let challenge = [1u8; 32];
        let nonce = [2u8; 32];
        let mac = svc.handshake_mac(secret, &challenge, &nonce);
        assert!(svc.verify_handshake_mac(secret, &challenge, &nonce, &mac));
        assert!(!svc.verify_handshake_mac(secret, &challenge, &nonce, &[0u8; 32]));
    }

    #[test]
    fn plaintext_markers_are_detected() {
        let svc = CryptoService::new();
        assert!(svc.looks_like_plaintext_credentials(b"SSID=HomeWifi;password=goodpass123"));
        assert!(svc.looks_like_plaintext_credentials(br#"{"ssid":"Home","password":"x"}"#));
    }

    #[test]
    fn low_entropy_payload_is_detected() {
        let svc = CryptoService::new();
        let payload = vec![b'a'; 64];
        assert!(svc.looks_like_plaintext_credentials(&payload));
    }

    #[test]
    fn real_ciphertext_is_not_flagged() {
        let svc = CryptoService::new();
        let ct = svc.encrypt(&[9u8; SESSION_KEY_LEN], b"{\"ssid\":\"HomeWifi\",\"password\":\"goodpass123\",\"security\":\"WPA2\"}").unwrap();
        assert!(!svc.looks_like_plaintext_credentials(&ct));
    }

    #[test]
    fn nonce_tracker_rejects_replay() {
        let mut tracker = NonceTracker::new(8);
        let nonce = [5u8; NONCE_LEN];
        assert!(tracker.observe(nonce).is_ok());
        assert_eq!(tracker.observe(nonce), Err(CryptoError::NonceReused));
    }
}
