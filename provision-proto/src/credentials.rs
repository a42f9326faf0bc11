//! `C_CREDENTIALS` wire framing and the JSON payload it carries once decrypted.

use serde::{Deserialize, Serialize};

use crate::ble::PROTOCOL_VERSION;

/// Nonce length for the AEAD used to protect `C_CREDENTIALS` writes (96-bit, as ChaCha20-Poly1305 and AES-GCM both use).
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("credentials frame too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}

/// The raw `ver(1) || nonce(12) || ct_and_tag(...)` envelope of a `C_CREDENTIALS` write,
/// before any decryption has been attempted.
#[derive(Debug, Clone)]
pub struct CredentialFrame {
    pub version: u8,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl CredentialFrame {
    /// Parse the raw bytes received on the characteristic. Does not look at the
    /// ciphertext contents; the caller is responsible for running
    /// `looks_like_plaintext_credentials` on `raw` *before* calling this.
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < 1 + NONCE_LEN {
            return Err(FrameError::TooShort(raw.len()));
        }
        let version = raw[0];
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[1..1 + NONCE_LEN]);
        let ciphertext = raw[1 + NONCE_LEN..].to_vec();
        Ok(Self {
            version,
            nonce,
            ciphertext,
        })
    }

    pub fn encode(version: u8, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        out.push(version);
        out.extend_from_slice(nonce);
        out.extend_from_slice(ciphertext);
        out
    }
}

/// Security type as carried on the wire and persisted in `WifiProfile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityType {
    Open,
    Wpa2,
    Wpa3,
    Enterprise,
}

/// The decrypted JSON payload of a `C_CREDENTIALS` write.
///
/// Ownership semantics (see `provision_core`): an instance of this type must
/// live only for the duration of the `decrypt -> validate -> act` window and
/// must be zeroised (the `String`/`Option<String>` fields overwritten)
/// before it is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialMessage {
    pub ssid: String,
    pub password: String,
    pub security: SecurityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
}

impl CredentialMessage {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Overwrite secret fields in place. Does not change the struct's
    /// validity as a JSON value, only its content.
    pub fn zeroize_in_place(&mut self) {
        zeroize_string(&mut self.ssid);
        zeroize_string(&mut self.password);
        if let Some(pin) = self.pin.as_mut() {
            zeroize_string(pin);
        }
        self.pin = None;
    }
}

fn zeroize_string(s: &mut String) {
    // SAFETY: we only ever write ASCII '0' bytes, which is always valid UTF-8,
    // so the string remains well-formed throughout.
    unsafe {
        for b in s.as_bytes_mut() {
            *b = b'0';
        }
    }
    s.clear();
}

impl Drop for CredentialMessage {
    fn drop(&mut self) {
        self.zeroize_in_place();
    }
}

/// `C_INFO` read value. Contains no secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub mac: String,
    pub proto_version: u8,
    pub fw_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let nonce = [7u8; NONCE_LEN];
        let ct = vec![1, 2, 3, 4];
        let raw = CredentialFrame::encode(PROTOCOL_VERSION, &nonce, &ct);
        let frame = CredentialFrame::parse(&raw).unwrap();
        assert_eq!(frame.version, PROTOCOL_VERSION);
        assert_eq!(frame.nonce, nonce);
        assert_eq!(frame.ciphertext, ct);
    }

    #[test]
    fn frame_rejects_short_input() {
        assert_eq!(CredentialFrame::parse(&[1, 2, 3]), Err(FrameError::TooShort(3)));
    }

    #[test]
    fn frame_rejects_unknown_version() {
        let raw = CredentialFrame::encode(9, &[0u8; NONCE_LEN], &[]);
        assert_eq!(CredentialFrame::parse(&raw), Err(FrameError::UnsupportedVersion(9)));
    }

    #[test]
    fn credential_message_json_round_trip() {
        let msg = CredentialMessage {
            ssid: "HomeWifi".into(),
            password: "goodpass123".into(),
            security: SecurityType::Wpa2,
            pin: None,
        };
        let bytes = msg.to_json().unwrap();
        let back = CredentialMessage::from_json(&bytes).unwrap();
        assert_eq!(back.ssid, "HomeWifi");
        assert_eq!(back.security, SecurityType::Wpa2);
    }

    #[test]
    fn credential_message_zeroizes_on_drop() {
        let mut msg = CredentialMessage {
            ssid: "HomeWifi".into(),
            password: "goodpass123".into(),
            security: SecurityType::Wpa2,
            pin: Some("1234".into()),
        };
        msg.zeroize_in_place();
        assert_eq!(msg.ssid, "");
        assert_eq!(msg.password, "");
        assert_eq!(msg.pin, None);
    }
}
