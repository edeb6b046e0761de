//! Device identifier type.
//!
//! A [`DeviceId`] is the stable serial number (udid) of one physical device.
//! It is validated once at the edge so every downstream component can treat
//! it as an opaque, well-formed key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of the placeholder ids the USB transport reports for devices it has
/// not finished pairing with. Events carrying such ids are noise.
pub const SENTINEL_PREFIX: &str = "ffffffffffffffffff";

/// Upper bound on udid length. Real serials are 25 or 40 characters.
const MAX_LEN: usize = 64;

/// A validated device serial number.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse and validate a device id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty, too long, contains characters
    /// other than ASCII alphanumerics, `-` or `_`, or is a transport sentinel.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_LEN {
            return Err(IdError::TooLong {
                max: MAX_LEN,
                got: s.len(),
            });
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(IdError::InvalidCharacter(c));
        }
        if Self::is_sentinel(s) {
            return Err(IdError::Sentinel);
        }
        Ok(Self(s.to_string()))
    }

    /// Returns true if `raw` is one of the transport's placeholder ids.
    #[must_use]
    pub fn is_sentinel(raw: &str) -> bool {
        raw.starts_with(SENTINEL_PREFIX)
    }

    /// Return the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines (first 7 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self.0.len().min(7);
        &self.0[..end]
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing a device id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The id was empty.
    #[error("device id is empty")]
    Empty,

    /// The id exceeded the maximum length.
    #[error("device id too long: max {max} characters, got {got}")]
    TooLong {
        /// Maximum accepted length.
        max: usize,
        /// Actual length.
        got: usize,
    },

    /// The id contained a character outside the accepted set.
    #[error("invalid character in device id: {0:?}")]
    InvalidCharacter(char),

    /// The id is a transport placeholder, not a real device.
    #[error("device id is a transport sentinel")]
    Sentinel,
}
