//! Process-lifetime cache backend.
//!
//! All state sits behind one read-write lock: records take it exclusively,
//! queries share it, so a candidate walk always sees one consistent state.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cache::candidates::{CandidateSelector, CandidateSource, DEFAULT_MAX_CANDIDATES};
use crate::cache::locations::LocationRegistry;
use crate::cache::types::{
    BlobCompression, Candidate, CandidateOptions, KnownLocation, LocationReference, LocationScope,
};
use crate::cache::{BlobInfoCache, CacheError, CacheStats};
use crate::digest::Digest;

#[derive(Debug, Default)]
struct MemoryState {
    /// Compressed digest -> uncompressed digest.
    uncompressed_digests: HashMap<Digest, Digest>,

    /// TOC digest -> uncompressed digest.
    uncompressed_digests_by_toc: HashMap<Digest, Digest>,

    /// Reverse index of `uncompressed_digests`.
    digests_by_uncompressed: HashMap<Digest, BTreeSet<Digest>>,

    compressions: HashMap<Digest, BlobCompression>,

    locations: LocationRegistry,
}

impl MemoryState {
    fn resolve_uncompressed(&self, digest: &Digest) -> Option<Digest> {
        if let Some(u) = self.uncompressed_digests.get(digest) {
            return Some(u.clone());
        }
        if let Some(u) = self.uncompressed_digests_by_toc.get(digest) {
            return Some(u.clone());
        }
        // Only uncompressed digests appear as reverse-index keys.
        self.digests_by_uncompressed
            .get(digest)
            .filter(|set| !set.is_empty())
            .map(|_| digest.clone())
    }
}

impl CandidateSource for MemoryState {
    fn uncompressed_digest(&self, digest: &Digest) -> Result<Option<Digest>, CacheError> {
        Ok(self.resolve_uncompressed(digest))
    }

    fn digests_with_uncompressed(&self, uncompressed: &Digest) -> Result<Vec<Digest>, CacheError> {
        Ok(self
            .digests_by_uncompressed
            .get(uncompressed)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn compression(&self, digest: &Digest) -> Result<BlobCompression, CacheError> {
        Ok(self
            .compressions
            .get(digest)
            .copied()
            .unwrap_or(BlobCompression::Unknown))
    }

    fn locations(&self, scope: &LocationScope, digest: &Digest) -> Result<Vec<KnownLocation>, CacheError> {
        Ok(self.locations.locations(scope, digest))
    }
}

/// In-memory blob info cache. Contents are lost when it is dropped.
#[derive(Debug)]
pub struct MemoryCache {
    state: RwLock<MemoryState>,
    selector: CandidateSelector,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_max_candidates(DEFAULT_MAX_CANDIDATES)
    }

    pub fn with_max_candidates(max_candidates: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            selector: CandidateSelector::new(max_candidates),
        }
    }
}

impl BlobInfoCache for MemoryCache {
    fn uncompressed_digest(&self, digest: &Digest) -> Result<Option<Digest>, CacheError> {
        Ok(self.state.read().resolve_uncompressed(digest))
    }

    fn uncompressed_digest_for_toc(&self, toc: &Digest) -> Result<Option<Digest>, CacheError> {
        Ok(self.state.read().uncompressed_digests_by_toc.get(toc).cloned())
    }

    fn record_digest_uncompressed_pair(
        &self,
        compressed: &Digest,
        uncompressed: &Digest,
    ) -> Result<(), CacheError> {
        let mut state = self.state.write();

        if let Some(previous) = state.uncompressed_digests.get(compressed).cloned() {
            if previous == *uncompressed {
                return Ok(());
            }
            warn!(
                compressed = %compressed,
                previous = %previous,
                uncompressed = %uncompressed,
                "Uncompressed digest changed, replacing"
            );
            if let Some(set) = state.digests_by_uncompressed.get_mut(&previous) {
                set.remove(compressed);
                if set.is_empty() {
                    state.digests_by_uncompressed.remove(&previous);
                }
            }
        }

        state
            .uncompressed_digests
            .insert(compressed.clone(), uncompressed.clone());
        state
            .digests_by_uncompressed
            .entry(uncompressed.clone())
            .or_default()
            .insert(compressed.clone());

        debug!(compressed = %compressed, uncompressed = %uncompressed, "Recorded uncompressed digest");
        Ok(())
    }

    fn record_toc_uncompressed_pair(&self, toc: &Digest, uncompressed: &Digest) -> Result<(), CacheError> {
        let mut state = self.state.write();

        if let Some(previous) = state.uncompressed_digests_by_toc.get(toc) {
            if previous == uncompressed {
                return Ok(());
            }
            warn!(
                toc = %toc,
                previous = %previous,
                uncompressed = %uncompressed,
                "Uncompressed digest for TOC changed, replacing"
            );
        }
        state
            .uncompressed_digests_by_toc
            .insert(toc.clone(), uncompressed.clone());

        debug!(toc = %toc, uncompressed = %uncompressed, "Recorded TOC uncompressed digest");
        Ok(())
    }

    fn record_digest_compression(
        &self,
        digest: &Digest,
        compression: BlobCompression,
    ) -> Result<(), CacheError> {
        if !compression.is_known() {
            return Ok(());
        }

        let mut state = self.state.write();
        if let Some(previous) = state.compressions.insert(digest.clone(), compression) {
            if previous != compression {
                warn!(
                    digest = %digest,
                    previous = %previous,
                    compression = %compression,
                    "Compression for blob changed, replacing"
                );
            }
        }
        Ok(())
    }

    fn record_known_location(
        &self,
        scope: &LocationScope,
        digest: &Digest,
        location: &LocationReference,
    ) -> Result<(), CacheError> {
        let last_used = self.state.write().locations.record(scope, digest, location);
        debug!(
            scope = %scope,
            digest = %digest,
            location = %location,
            last_used = last_used.as_nanos(),
            "Recorded known location"
        );
        Ok(())
    }

    fn candidate_locations(
        &self,
        scope: &LocationScope,
        primary: &Digest,
        options: &CandidateOptions,
    ) -> Result<Vec<Candidate>, CacheError> {
        let state = self.state.read();
        self.selector.select(&*state, scope, primary, options)
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let state = self.state.read();
        Ok(CacheStats {
            compression_relations: state.uncompressed_digests.len(),
            toc_relations: state.uncompressed_digests_by_toc.len(),
            digest_compressions: state.compressions.len(),
            known_locations: state.locations.len(),
        })
    }

    fn close(self: Box<Self>) -> Result<(), CacheError> {
        Ok(())
    }
}
