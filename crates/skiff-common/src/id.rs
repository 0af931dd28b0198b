//! Container identifiers, names, and content digests.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::{SkiffError, SkiffResult};

/// A generated container ID.
///
/// IDs are 64 lowercase hex characters. The first 12 characters form the
/// short ID shown by listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Length of a full container ID.
    pub const LENGTH: usize = 64;

    /// Length of the short form.
    pub const SHORT_LENGTH: usize = 12;

    /// Generate a new random container ID from two v4 UUIDs.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self(hex::encode(bytes))
    }

    /// Parse a full container ID.
    ///
    /// # Errors
    ///
    /// Returns an error unless `id` is exactly 64 lowercase hex characters.
    pub fn new(id: impl Into<String>) -> SkiffResult<Self> {
        let id = id.into();
        let valid = id.len() == Self::LENGTH
            && id
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid {
            return Err(SkiffError::validation(format!(
                "malformed container id: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the short form of the ID.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..Self::SHORT_LENGTH.min(self.0.len())]
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// Hashes and compares exactly like the inner string.
impl Borrow<str> for ContainerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated, user-supplied container name.
///
/// Names must:
/// - Be 1-128 characters long
/// - Start with an alphanumeric character
/// - Contain only alphanumeric characters, `_`, `.` and `-`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(String);

impl ContainerName {
    /// Maximum length of a container name.
    pub const MAX_LENGTH: usize = 128;

    /// Create a new container name, validating the format.
    ///
    /// A single leading `/` (the form listings print) is accepted and stripped.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidName`] if the format is invalid.
    pub fn new(name: impl Into<String>) -> SkiffResult<Self> {
        let name = name.into();
        let trimmed = name.strip_prefix('/').unwrap_or(&name);
        Self::validate(trimmed)?;
        Ok(Self(trimmed.to_string()))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> SkiffResult<()> {
        let invalid = || SkiffError::InvalidName {
            name: name.to_string(),
        };

        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        let mut chars = name.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerName {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A content-addressable digest (e.g., sha256:abc123...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// The algorithm used (e.g., "sha256").
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl Digest {
    /// Create a new digest.
    #[must_use]
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// Create a SHA-256 digest.
    #[must_use]
    pub fn sha256(hash: impl Into<String>) -> Self {
        Self::new("sha256", hash)
    }

    /// Returns the first 12 characters of the hash.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.hash[..12.min(self.hash.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Digest {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hash)) if !algorithm.is_empty() && !hash.is_empty() => {
                Ok(Self::new(algorithm, hash))
            }
            _ => Err(SkiffError::validation(format!("malformed digest: {s}"))),
        }
    }
}
