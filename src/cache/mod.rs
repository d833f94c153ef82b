//! Blob info cache.
//!
//! Records which digests are equivalent (compressed vs. uncompressed content,
//! table-of-contents digests) and where blobs were seen, and ranks reuse
//! candidates on query.
//! - [`types`]: scopes, locations, compression and candidate types
//! - [`locations`]: in-process registry of known locations
//! - [`candidates`]: candidate ranking and filtering
//! - [`memory`]: process-lifetime backend
//! - [`sqlite`]: persistent, transactional backend

pub mod candidates;
pub mod locations;
pub mod memory;
pub mod sqlite;
pub mod types;

use serde::Serialize;
use thiserror::Error;

use crate::config::{BackendKind, CacheConfig};
use crate::digest::{Digest, DigestError};
use types::{BlobCompression, Candidate, CandidateOptions, LocationReference, LocationScope};

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache data in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[error("Unsupported cache schema version {found} (expected {expected})")]
    SchemaVersion { found: String, expected: u32 },

    #[error("Invalid digest: {0}")]
    Digest(#[from] DigestError),
}

impl CacheError {
    /// Whether the storage itself failed, as opposed to bad input.
    pub fn is_backend_failure(&self) -> bool {
        !matches!(self, CacheError::Digest(_))
    }
}

/// Entry counts, for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub compression_relations: usize,
    pub toc_relations: usize,
    pub digest_compressions: usize,
    pub known_locations: usize,
}

/// The storage-agnostic cache contract.
///
/// Every `record_*` call is atomic: concurrent readers see a fact either
/// fully applied or not at all. Queries never mutate state. "Not found" is
/// `None` or an empty list, never an error.
pub trait BlobInfoCache: Send + Sync {
    /// The uncompressed equivalent of `digest`: through a compression
    /// relation, through a TOC relation, or `digest` itself when it is known
    /// to be uncompressed.
    fn uncompressed_digest(&self, digest: &Digest) -> Result<Option<Digest>, CacheError>;

    /// The uncompressed digest indexed by a table-of-contents digest.
    fn uncompressed_digest_for_toc(&self, toc: &Digest) -> Result<Option<Digest>, CacheError>;

    /// Record that `compressed` decompresses to `uncompressed`.
    ///
    /// `compressed == uncompressed` records that the blob is uncompressed.
    /// Re-recording a different target replaces the old one.
    fn record_digest_uncompressed_pair(
        &self,
        compressed: &Digest,
        uncompressed: &Digest,
    ) -> Result<(), CacheError>;

    /// Record that the blob with table of contents `toc` has `uncompressed`
    /// content. Re-recording a different target replaces the old one.
    fn record_toc_uncompressed_pair(&self, toc: &Digest, uncompressed: &Digest) -> Result<(), CacheError>;

    /// Record how the blob `digest` is compressed. `Unknown` never replaces
    /// a known value.
    fn record_digest_compression(
        &self,
        digest: &Digest,
        compression: BlobCompression,
    ) -> Result<(), CacheError>;

    /// Insert `location` for `digest` in `scope`, or refresh its last-used time.
    fn record_known_location(
        &self,
        scope: &LocationScope,
        digest: &Digest,
        location: &LocationReference,
    ) -> Result<(), CacheError>;

    /// Ranked, bounded reuse candidates for `primary` in `scope`.
    fn candidate_locations(
        &self,
        scope: &LocationScope,
        primary: &Digest,
        options: &CandidateOptions,
    ) -> Result<Vec<Candidate>, CacheError>;

    fn stats(&self) -> Result<CacheStats, CacheError>;

    /// Release the backend's storage. Dropping the cache also releases it;
    /// `close` additionally reports failures.
    fn close(self: Box<Self>) -> Result<(), CacheError>;
}

/// Open the backend selected by `config`.
pub fn open_cache(config: &CacheConfig) -> Result<Box<dyn BlobInfoCache>, CacheError> {
    match config.backend {
        BackendKind::Memory => Ok(Box::new(MemoryCache::with_max_candidates(
            config.max_candidates,
        ))),
        BackendKind::Sqlite => Ok(Box::new(SqliteCache::open_with_config(config)?)),
    }
}
