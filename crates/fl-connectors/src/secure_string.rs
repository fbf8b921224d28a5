//! Zeroizing string type for credentials.
//!
//! Intake keys, client secrets, passwords and access tokens all travel as
//! [`SecureString`]. The buffer is wiped when dropped and never rendered by
//! `Debug` or `Display`, so a credential cannot leak through a log line.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroizing;

/// A credential string that is zeroized on drop and redacted when formatted.
///
/// # Example
///
/// ```
/// use fl_connectors::SecureString;
///
/// let key = SecureString::from("intake-key");
/// assert_eq!(key.expose_secret(), "intake-key");
/// assert_eq!(format!("{:?}", key), "SecureString([REDACTED])");
/// ```
#[derive(Clone, Default)]
pub struct SecureString(Zeroizing<String>);

impl SecureString {
    /// Wraps `value`.
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    /// Borrows the plaintext. Copies made from it are not zeroized.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Length of the plaintext in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecureString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SecureString {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureString([REDACTED])")
    }
}

impl fmt::Display for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for SecureString {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for SecureString {}

// Serialization writes the plaintext: configuration files and the token
// endpoint need the real value. Redaction for display happens in the host.
impl Serialize for SecureString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecureString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecureString::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expose_secret() {
        let secret = SecureString::from("client-secret");
        assert_eq!(secret.expose_secret(), "client-secret");
        assert_eq!(secret.len(), 13);
    }

    #[test]
    fn test_blank_detection() {
        assert!(SecureString::default().is_blank());
        assert!(SecureString::from("  \t").is_blank());
        assert!(!SecureString::from("k").is_blank());
    }

    #[test]
    fn test_formatting_is_redacted() {
        let secret = SecureString::from("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn test_equality() {
        assert_eq!(SecureString::from("a"), SecureString::from("a"));
        assert_ne!(SecureString::from("a"), SecureString::from("b"));
    }

    #[test]
    fn test_deserialize_from_config() {
        #[derive(Deserialize)]
        struct Creds {
            secret: SecureString,
        }
        let creds: Creds = serde_json::from_str(r#"{"secret":"s3cr3t"}"#).unwrap();
        assert_eq!(creds.secret.expose_secret(), "s3cr3t");
    }
}
