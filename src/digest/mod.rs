//! Content digests.
//!
//! A [`Digest`] is the `algorithm:encoded` identity of a blob. Digests are
//! immutable values; relations in the cache always name them by value.
//!
//! - [`registry`]: which algorithms are acceptable for newly created content

pub mod registry;

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("invalid digest {0:?}: expected \"algorithm:encoded\"")]
    InvalidFormat(String),

    #[error("invalid digest algorithm {0:?}")]
    InvalidAlgorithm(String),

    #[error("invalid encoded portion in digest {0:?}")]
    InvalidEncoding(String),

    #[error("unsupported digest algorithm: {0:?}")]
    UnsupportedAlgorithm(String),
}

/// A digest algorithm name such as `sha256`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Algorithm(Cow<'static, str>);

impl Algorithm {
    pub const SHA256: Algorithm = Algorithm(Cow::Borrowed("sha256"));
    pub const SHA384: Algorithm = Algorithm(Cow::Borrowed("sha384"));
    pub const SHA512: Algorithm = Algorithm(Cow::Borrowed("sha512"));

    /// The algorithm used when nothing else has been configured.
    pub const CANONICAL: Algorithm = Algorithm::SHA256;

    /// Wrap an arbitrary algorithm name. The name is not validated here;
    /// [`Digest::parse`] and the registry decide what is acceptable.
    pub fn new(name: impl Into<String>) -> Self {
        Algorithm(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length of the hex encoding for algorithms with a fixed-size output.
    pub fn hex_length(&self) -> Option<usize> {
        match self.as_str() {
            "sha256" => Some(64),
            "sha384" => Some(96),
            "sha512" => Some(128),
            _ => None,
        }
    }

    /// Hash `data` with this algorithm.
    pub fn hash(&self, data: &[u8]) -> Result<Digest, DigestError> {
        let encoded = match self.as_str() {
            "sha256" => hex::encode(Sha256::digest(data)),
            "sha384" => hex::encode(Sha384::digest(data)),
            "sha512" => hex::encode(Sha512::digest(data)),
            other => return Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        };
        Ok(Digest(format!("{}:{}", self.as_str(), encoded)))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated `algorithm:encoded` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| DigestError::InvalidFormat(s.to_string()))?;

        if !is_valid_algorithm(algorithm) {
            return Err(DigestError::InvalidAlgorithm(algorithm.to_string()));
        }
        if encoded.is_empty()
            || !encoded
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'))
        {
            return Err(DigestError::InvalidEncoding(s.to_string()));
        }

        // Known fixed-size algorithms must carry exactly that much lowercase hex.
        if let Some(len) = Algorithm::new(algorithm).hex_length() {
            let is_hex = encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
            if encoded.len() != len || !is_hex {
                return Err(DigestError::InvalidEncoding(s.to_string()));
            }
        }

        Ok(Digest(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> Algorithm {
        Algorithm::new(self.algorithm_str())
    }

    fn algorithm_str(&self) -> &str {
        // Validated on construction.
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// The portion after the algorithm prefix.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or_default()
    }
}

/// `[a-z0-9]+` components joined by single `+`, `.`, `_` or `-` separators.
fn is_valid_algorithm(name: &str) -> bool {
    !name.is_empty()
        && name
            .split(|c: char| matches!(c, '+' | '.' | '_' | '-'))
            .all(|part| {
                !part.is_empty()
                    && part
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            })
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.0
    }
}
