//! Digest algorithms acceptable for newly created content.
//!
//! The registry is a small shared cell: it starts out at the canonical
//! algorithm and may be switched to the one supported alternate. Callers hold
//! a [`DigestRegistry`] handle explicitly; clones share the same cell.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{Algorithm, Digest, DigestError};

/// Algorithms that may be selected for new objects, canonical first.
const SUPPORTED: [Algorithm; 2] = [Algorithm::SHA256, Algorithm::SHA512];

/// Shared handle to the digest algorithm used for new objects.
#[derive(Debug, Clone)]
pub struct DigestRegistry {
    current: Arc<RwLock<Algorithm>>,
}

impl Default for DigestRegistry {
    fn default() -> Self {
        Self {
            current: Arc::new(RwLock::new(Algorithm::CANONICAL)),
        }
    }
}

impl DigestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry already switched to `algorithm`.
    pub fn with_algorithm(algorithm: &Algorithm) -> Result<Self, DigestError> {
        let registry = Self::new();
        registry.set_algorithm_for_new_objects(algorithm)?;
        Ok(registry)
    }

    /// The algorithm currently used for newly created content.
    pub fn algorithm_for_new_objects(&self) -> Algorithm {
        self.current.read().clone()
    }

    /// Switch the algorithm for new objects.
    ///
    /// An empty name selects the canonical algorithm. Unsupported algorithms
    /// are rejected and the current setting is left untouched.
    pub fn set_algorithm_for_new_objects(&self, algorithm: &Algorithm) -> Result<(), DigestError> {
        let algorithm = if algorithm.is_empty() {
            Algorithm::CANONICAL
        } else {
            algorithm.clone()
        };
        if !SUPPORTED.contains(&algorithm) {
            return Err(DigestError::UnsupportedAlgorithm(algorithm.to_string()));
        }

        let mut current = self.current.write();
        if *current != algorithm {
            debug!(from = current.as_str(), to = algorithm.as_str(), "Digest algorithm for new objects changed");
        }
        *current = algorithm;
        Ok(())
    }

    /// Compute the digest of newly created content.
    pub fn digest_for_new_object(&self, data: &[u8]) -> Result<Digest, DigestError> {
        self.algorithm_for_new_objects().hash(data)
    }

    /// Whether `algorithm` may be used for new objects. The empty name stands
    /// for the canonical algorithm.
    pub fn is_supported(algorithm: &Algorithm) -> bool {
        algorithm.is_empty() || SUPPORTED.contains(algorithm)
    }

    pub fn supported_algorithms() -> Vec<Algorithm> {
        SUPPORTED.to_vec()
    }

    /// Human-readable name, matched case-insensitively.
    pub fn algorithm_name(algorithm: &Algorithm) -> &'static str {
        match algorithm.as_str().to_ascii_lowercase().as_str() {
            "sha256" => "SHA256",
            "sha512" => "SHA512",
            _ => "unknown",
        }
    }

    /// Hex length of a supported algorithm's encoded digest.
    pub fn expected_length(algorithm: &Algorithm) -> Option<usize> {
        if SUPPORTED.contains(algorithm) {
            algorithm.hex_length()
        } else {
            None
        }
    }

    /// The supported algorithm whose encoded digests have `length` characters.
    pub fn detect_from_length(length: usize) -> Option<Algorithm> {
        SUPPORTED
            .into_iter()
            .find(|alg| alg.hex_length() == Some(length))
    }
}
