//! In-process registry of known blob locations.
//!
//! For every (scope, digest) pair the registry keeps each location the blob
//! was seen at, together with the time it was last used. Recording is
//! insert-or-refresh; nothing is ever removed, so losing one reference does
//! not lose knowledge of another.

use std::collections::HashMap;

use crate::cache::types::{KnownLocation, LocationReference, LocationScope, Timestamp};
use crate::digest::Digest;

#[derive(Debug, Default)]
pub struct LocationRegistry {
    /// Locations indexed by scope, then digest.
    entries: HashMap<LocationScope, HashMap<Digest, HashMap<LocationReference, Timestamp>>>,

    /// Latest stamp handed out, so every record is strictly newer.
    latest: Option<Timestamp>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `location` or bump its last-used time. Returns the new stamp.
    pub fn record(
        &mut self,
        scope: &LocationScope,
        digest: &Digest,
        location: &LocationReference,
    ) -> Timestamp {
        let now = Timestamp::next_after(self.latest);
        self.latest = Some(now);

        self.entries
            .entry(scope.clone())
            .or_default()
            .entry(digest.clone())
            .or_default()
            .insert(location.clone(), now);
        now
    }

    /// All locations of `digest` within `scope`, most recently used first.
    pub fn locations(&self, scope: &LocationScope, digest: &Digest) -> Vec<KnownLocation> {
        let mut found: Vec<KnownLocation> = self
            .entries
            .get(scope)
            .and_then(|by_digest| by_digest.get(digest))
            .map(|locations| {
                locations
                    .iter()
                    .map(|(location, last_used)| KnownLocation {
                        location: location.clone(),
                        last_used: *last_used,
                    })
                    .collect()
            })
            .unwrap_or_default();

        found.sort_by(|a, b| {
            b.last_used
                .cmp(&a.last_used)
                .then_with(|| a.location.cmp(&b.location))
        });
        found
    }

    /// Number of (scope, digest, location) entries.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|by_digest| by_digest.values())
            .map(|locations| locations.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
