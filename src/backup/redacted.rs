//! Remote password handling.
//!
//! Provides `ObfuscatedPassword`, which keeps the password in its at-rest base64 form and
//! only yields the plaintext, wrapped in [`Zeroizing`], at the moment it is needed.

use crate::backup::result_error::result::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::result;
use zeroize::{Zeroize, Zeroizing};

/// Placeholder text shown instead of the password in logs/debug output
pub static REDACTED_PASSWORD: &str = "###REDACTED_PASSWORD###";

/// A remote password stored base64-encoded.
///
/// Serializes to (and deserializes from) the encoded form, so configuration files never
/// hold the plaintext. Debug output is always redacted and memory is zeroed on drop.
#[derive(Clone, Default, Zeroize, PartialEq, Eq)]
pub struct ObfuscatedPassword {
    encoded: String,
}

impl ObfuscatedPassword {
    /// Wraps an already base64-encoded password.
    pub fn from_encoded<S: Into<String>>(encoded: S) -> Self {
        Self {
            encoded: encoded.into(),
        }
    }

    pub fn from_plaintext<S: AsRef<str>>(plaintext: S) -> Self {
        Self {
            encoded: BASE64.encode(plaintext.as_ref()),
        }
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    /// Decodes the password. Call immediately before use and drop the result quickly.
    pub fn reveal(&self) -> Result<Zeroizing<String>> {
        let bytes = Zeroizing::new(BASE64.decode(self.encoded.as_bytes())?);
        Ok(Zeroizing::new(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

impl Debug for ObfuscatedPassword {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", REDACTED_PASSWORD)
    }
}

impl Serialize for ObfuscatedPassword {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

struct ObfuscatedPasswordVisitor;

impl Visitor<'_> for ObfuscatedPasswordVisitor {
    type Value = ObfuscatedPassword;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a base64 encoded password")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        BASE64
            .decode(v.as_bytes())
            .map(|mut decoded| decoded.zeroize())
            .map_err(serde::de::Error::custom)?;
        Ok(ObfuscatedPassword::from_encoded(v))
    }
}

impl<'de> Deserialize<'de> for ObfuscatedPassword {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(ObfuscatedPasswordVisitor)
    }
}

impl Drop for ObfuscatedPassword {
    fn drop(&mut self) {
        self.zeroize();
    }
}
