//! Candidate selection: turns recorded facts into a short, ranked list of
//! blobs that could be reused instead of transferring the primary blob.
//!
//! Ranking, most significant first:
//! 1. exact digest match
//! 2. compression satisfying the required compression (when one is set)
//! 3. more recently used location
//! 4. digest, then location, ascending (deterministic tie-break)
//!
//! The selector only reads through a [`CandidateSource`]; each backend
//! provides one view that stays consistent for the whole walk.

use std::cmp::{Ordering, Reverse};

use tracing::debug;

use crate::cache::types::{
    BlobCompression, Candidate, CandidateOptions, KnownLocation, LocationReference, LocationScope,
    Timestamp,
};
use crate::cache::CacheError;
use crate::digest::Digest;

/// How many candidates a query returns unless configured otherwise.
///
/// Callers probe candidates one by one and stop at the first success, so a
/// long list only adds failed round-trips.
pub const DEFAULT_MAX_CANDIDATES: usize = 5;

/// Read access to recorded facts, valid for one consistent snapshot.
pub trait CandidateSource {
    /// Uncompressed equivalent of `digest`, as for
    /// [`BlobInfoCache::uncompressed_digest`](crate::cache::BlobInfoCache::uncompressed_digest).
    fn uncompressed_digest(&self, digest: &Digest) -> Result<Option<Digest>, CacheError>;

    /// Every digest with a compression relation to `uncompressed`.
    fn digests_with_uncompressed(&self, uncompressed: &Digest) -> Result<Vec<Digest>, CacheError>;

    /// Recorded compression of `digest`, `Unknown` if none.
    fn compression(&self, digest: &Digest) -> Result<BlobCompression, CacheError>;

    /// Locations of `digest` within `scope`.
    fn locations(&self, scope: &LocationScope, digest: &Digest) -> Result<Vec<KnownLocation>, CacheError>;
}

/// A candidate together with its sort key.
#[derive(Debug, Clone)]
struct RankedCandidate {
    candidate: Candidate,
    is_primary: bool,
    compression_matches: bool,
}

impl RankedCandidate {
    fn sort_key(&self) -> (bool, bool, Reverse<Timestamp>, &Digest, &LocationReference) {
        (
            !self.is_primary,
            !self.compression_matches,
            Reverse(self.candidate.last_used),
            &self.candidate.digest,
            &self.candidate.location,
        )
    }
}

// Smaller sorts first (better candidate).
impl PartialEq for RankedCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankedCandidate {}

impl PartialOrd for RankedCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankedCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// The candidate ranking engine.
#[derive(Debug, Clone)]
pub struct CandidateSelector {
    max_candidates: usize,
}

impl Default for CandidateSelector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CANDIDATES)
    }
}

impl CandidateSelector {
    pub fn new(max_candidates: usize) -> Self {
        Self { max_candidates }
    }

    pub fn max_candidates(&self) -> usize {
        self.max_candidates
    }

    /// Select up to `max_candidates` reuse candidates for `primary` in `scope`.
    pub fn select(
        &self,
        source: &dyn CandidateSource,
        scope: &LocationScope,
        primary: &Digest,
        options: &CandidateOptions,
    ) -> Result<Vec<Candidate>, CacheError> {
        let (digests, uncompressed) = candidate_digests(source, primary, options)?;

        let mut ranked = Vec::new();
        for digest in &digests {
            let locations = source.locations(scope, digest)?;
            if locations.is_empty() {
                continue;
            }

            let mut compression = source.compression(digest)?;
            if !compression.is_known() && uncompressed.as_ref() == Some(digest) {
                compression = BlobCompression::Uncompressed;
            }

            if !options.possible_manifest_formats.is_empty()
                && !options
                    .possible_manifest_formats
                    .iter()
                    .any(|format| format.accepts(&compression))
            {
                debug!(
                    digest = %digest,
                    compression = %compression,
                    "Skipping candidate not usable in any allowed manifest format"
                );
                continue;
            }

            let compression_matches = options
                .required_compression
                .map(|required| compression.satisfies(required))
                .unwrap_or(false);

            for known in locations {
                ranked.push(RankedCandidate {
                    candidate: Candidate {
                        digest: digest.clone(),
                        location: known.location,
                        compression: compression.operation(),
                        last_used: known.last_used,
                    },
                    is_primary: digest == primary,
                    compression_matches,
                });
            }
        }

        ranked.sort();
        let total = ranked.len();
        ranked.truncate(self.max_candidates);

        debug!(
            primary = %primary,
            scope = %scope,
            can_substitute = options.can_substitute,
            considered = total,
            returned = ranked.len(),
            "Selected reuse candidates"
        );

        Ok(ranked.into_iter().map(|r| r.candidate).collect())
    }
}

/// The primary digest, then (when substituting) its alternates sorted by
/// digest, then the uncompressed digest. Also returns the uncompressed
/// digest when one is known, whether or not substitution is allowed.
fn candidate_digests(
    source: &dyn CandidateSource,
    primary: &Digest,
    options: &CandidateOptions,
) -> Result<(Vec<Digest>, Option<Digest>), CacheError> {
    let mut digests = vec![primary.clone()];
    let uncompressed = source.uncompressed_digest(primary)?;
    if !options.can_substitute {
        return Ok((digests, uncompressed));
    }

    if let Some(u) = &uncompressed {
        let mut others = source.digests_with_uncompressed(u)?;
        others.sort();
        for d in others {
            if !digests.contains(&d) {
                digests.push(d);
            }
        }
        if !digests.contains(u) {
            digests.push(u.clone());
        }
    }
    Ok((digests, uncompressed))
}
