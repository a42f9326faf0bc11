//! Validator (C4): whitelist-driven structural/semantic validation of every
//! value that crosses the BLE boundary. Rejection is categorical, never
//! sanitising — a rejected value is never silently repaired and resubmitted.

use provision_proto::SecurityType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

const SSID_MIN: usize = 1;
const SSID_MAX: usize = 32;
const WPA2_PASSWORD_MIN: usize = 8;
const WPA2_PASSWORD_MAX: usize = 63;
const OWNER_NAME_MIN: usize = 2;
const OWNER_NAME_MAX: usize = 64;
const VALID_PIN_LENGTHS: &[usize] = &[4, 5, 6, 7, 8];

/// Injection indicators that cause categorical rejection, independent of
/// length/charset checks: SQL quoting/terminators, shell metacharacters,
/// LDAP special characters, HTML/script tags.
const INJECTION_PATTERNS: &[&str] = &[
    "'", "\"", ";", "--", "/*", "*/",
    "&", "|", "`", "$(", ">", "<",
    "(", ")", "\\",
    "<script", "</script", "<img", "onerror=",
];

const ZERO_WIDTH_CHARS: [char; 6] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{200E}', '\u{200F}', '\u{FEFF}'];

fn contains_injection_pattern(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    INJECTION_PATTERNS.iter().any(|p| lower.contains(p))
}

fn contains_zero_width(value: &str) -> bool {
    value.chars().any(|c| ZERO_WIDTH_CHARS.contains(&c))
}

pub fn validate_ssid(ssid: &str) -> Result<(), ValidationError> {
    let len = ssid.len();
    if !(SSID_MIN..=SSID_MAX).contains(&len) {
        return Err(ValidationError::new("ssid", format!("length {len} outside {SSID_MIN}..={SSID_MAX}")));
    }
    if contains_zero_width(ssid) {
        return Err(ValidationError::new("ssid", "contains zero-width unicode"));
    }
    if !ssid.chars().all(|c| c.is_ascii_alphanumeric() || " _.-".contains(c)) {
        return Err(ValidationError::new("ssid", "contains characters outside [A-Za-z0-9 _.-]"));
    }
    if contains_injection_pattern(ssid) {
        return Err(ValidationError::new("ssid", "matches an injection pattern"));
    }
    Ok(())
}

pub fn validate_password(password: &str, security: SecurityType) -> Result<(), ValidationError> {
    match security {
        SecurityType::Open => {
            if !password.is_empty() {
                return Err(ValidationError::new("password", "must be empty for an open network"));
            }
            Ok(())
        }
        SecurityType::Wpa2 | SecurityType::Wpa3 | SecurityType::Enterprise => {
            let len = password.chars().count();
            if !(WPA2_PASSWORD_MIN..=WPA2_PASSWORD_MAX).contains(&len) {
                return Err(ValidationError::new(
                    "password",
                    format!("length {len} outside {WPA2_PASSWORD_MIN}..={WPA2_PASSWORD_MAX}"),
                ));
            }
            if password.chars().any(|c| c.is_control()) {
                return Err(ValidationError::new("password", "contains control characters"));
            }
            Ok(())
        }
    }
}

pub fn validate_pin(pin: &str) -> Result<(), ValidationError> {
    if pin.is_empty() || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::new("pin", "must contain digits only"));
    }
    if !VALID_PIN_LENGTHS.contains(&pin.len()) {
        return Err(ValidationError::new("pin", format!("length {} not in 4..=8", pin.len())));
    }
    if is_all_same_digit(pin) {
        return Err(ValidationError::new("pin", "all digits identical"));
    }
    if is_sequential(pin) {
        return Err(ValidationError::new("pin", "digits form a sequential run"));
    }
    Ok(())
}

fn is_all_same_digit(pin: &str) -> bool {
    let mut chars = pin.chars();
    let first = chars.next().expect("pin non-empty, checked above");
    chars.all(|c| c == first)
}

fn is_sequential(pin: &str) -> bool {
    let digits: Vec<i8> = pin.bytes().map(|b| (b - b'0') as i8).collect();
    let ascending = digits.windows(2).all(|w| (w[1] - w[0] + 10) % 10 == 1);
    let descending = digits.windows(2).all(|w| (w[0] - w[1] + 10) % 10 == 1);
    ascending || descending
}

pub fn validate_owner_name(name: &str) -> Result<(), ValidationError> {
    let len = name.chars().count();
    if !(OWNER_NAME_MIN..=OWNER_NAME_MAX).contains(&len) {
        return Err(ValidationError::new("owner_name", format!("length {len} outside {OWNER_NAME_MIN}..={OWNER_NAME_MAX}")));
    }
    if name.trim().is_empty() {
        return Err(ValidationError::new("owner_name", "must not be only whitespace"));
    }
    if contains_zero_width(name) {
        return Err(ValidationError::new("owner_name", "contains zero-width unicode"));
    }
    if contains_injection_pattern(name) {
        return Err(ValidationError::new("owner_name", "matches an injection pattern"));
    }
    Ok(())
}
