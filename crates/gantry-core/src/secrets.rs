//! Secret value type.

use std::fmt;

/// A resolved secret.
///
/// `Debug` never prints the value, so a secret can sit inside any struct
/// that gets logged without leaking.
#[derive(Clone)]
pub struct SecretValue {
    value: String,
    pub version: Option<String>,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Expose the plaintext. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("value", &"***")
            .field("version", &self.version)
            .finish()
    }
}
