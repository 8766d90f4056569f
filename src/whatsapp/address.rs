//! Phone number and JID handling.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use super::ConnectionError;

/// WhatsApp user server suffix.
const USER_SERVER: &str = "s.whatsapp.net";

static JID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\+?(\d+)(?::\d+)?(?:@[\w.]+)?$").expect("static regex")
});

/// Home-country numbering rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addressing {
    pub country_code: String,
    /// Digits in a full international number.
    pub international_length: usize,
}

impl Default for Addressing {
    fn default() -> Self {
        Self { country_code: "62".to_string(), international_length: 12 }
    }
}

/// A normalized WhatsApp user (international digits, no `+`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    pub fn user(&self) -> &str {
        &self.0
    }

    pub fn jid(&self) -> String {
        format!("{}@{}", self.0, USER_SERVER)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a free-form phone number into an `Address`.
///
/// Non-digits are stripped. A local number loses its trunk `0` and gets the
/// country code prepended, as does a short number without the country code.
pub fn normalize(raw: &str, rules: &Addressing) -> Result<Address, ConnectionError> {
    let mut digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(ConnectionError::InvalidRecipient(raw.to_string()));
    }

    if let Some(local) = digits.strip_prefix('0') {
        digits = format!("{}{}", rules.country_code, local);
    } else if !digits.starts_with(&rules.country_code) && digits.len() < rules.international_length {
        digits = format!("{}{}", rules.country_code, digits);
    }

    Ok(Address(digits))
}

/// User part of a sender JID, e.g. `6281234:3@s.whatsapp.net` → `6281234`.
pub fn sender_from_jid(jid: &str) -> Option<String> {
    JID_RE.captures(jid.trim()).map(|c| c[1].to_string())
}
