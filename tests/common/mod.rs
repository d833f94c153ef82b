//! Behavioral suite every blob info cache backend must pass.
//!
//! Each check takes a constructor for a fresh, empty cache. Backend test
//! files instantiate the whole suite with `blob_info_cache_conformance!`.

use std::collections::HashSet;
use std::ops::Deref;

use tempfile::TempDir;

use blob_info_cache::cache::candidates::DEFAULT_MAX_CANDIDATES;
use blob_info_cache::cache::types::{
    BlobCompression, Candidate, CandidateOptions, CompressionAlgorithm, CompressionOperation,
    LocationReference, LocationScope, ManifestFormat,
};
use blob_info_cache::cache::{BlobInfoCache, CacheStats};
use blob_info_cache::digest::Digest;

/// A cache under test plus whatever must outlive it.
pub struct TestCache {
    cache: Box<dyn BlobInfoCache>,
    _dir: Option<TempDir>,
}

impl TestCache {
    pub fn new(cache: Box<dyn BlobInfoCache>, dir: Option<TempDir>) -> Self {
        Self { cache, _dir: dir }
    }
}

impl Deref for TestCache {
    type Target = dyn BlobInfoCache;

    fn deref(&self) -> &Self::Target {
        self.cache.as_ref()
    }
}

pub type NewCache = fn() -> TestCache;

macro_rules! blob_info_cache_conformance {
    ($new_cache:expr) => {
        blob_info_cache_conformance!(@tests $new_cache;
            empty_cache,
            uncompressed_digest,
            record_pair_is_idempotent,
            record_pair_last_write_wins,
            toc_relations,
            known_locations_insert_or_refresh,
            scope_isolation,
            exact_match_only_without_substitution,
            substitution_finds_alternate_compression,
            substitution_includes_uncompressed_digest,
            substitution_through_toc,
            exact_query_on_uncompressed_digest,
            manifest_formats_filter_candidates,
            required_compression_is_preferred,
            compression_records,
            bounded_output,
            deterministic_order,
            concurrent_records_and_queries,
        );
    };
    (@tests $new_cache:expr; $($name:ident),* $(,)?) => {
        $(
            #[test]
            fn $name() {
                common::$name($new_cache);
            }
        )*
    };
}

pub fn digest(n: u32) -> Digest {
    Digest::parse(&format!("sha256:{n:064x}")).unwrap()
}

pub fn scope(name: &str) -> LocationScope {
    LocationScope::new("docker", name)
}

pub fn loc(name: &str) -> LocationReference {
    LocationReference::new(name)
}

fn summary(candidates: &[Candidate]) -> Vec<(Digest, String)> {
    candidates
        .iter()
        .map(|c| (c.digest.clone(), c.location.as_str().to_string()))
        .collect()
}

pub fn empty_cache(new_cache: NewCache) {
    let cache = new_cache();
    let d = digest(1);

    assert_eq!(cache.uncompressed_digest(&d).unwrap(), None);
    assert_eq!(cache.uncompressed_digest_for_toc(&d).unwrap(), None);
    for options in [CandidateOptions::exact(), CandidateOptions::substitutable()] {
        assert!(cache.candidate_locations(&scope("s"), &d, &options).unwrap().is_empty());
    }
    assert_eq!(cache.stats().unwrap(), CacheStats::default());
}

pub fn uncompressed_digest(new_cache: NewCache) {
    let cache = new_cache();
    let (compressed, uncompressed, other) = (digest(1), digest(2), digest(3));

    cache
        .record_digest_uncompressed_pair(&compressed, &uncompressed)
        .unwrap();
    assert_eq!(cache.uncompressed_digest(&compressed).unwrap(), Some(uncompressed.clone()));
    // The target of a relation is known to be uncompressed.
    assert_eq!(cache.uncompressed_digest(&uncompressed).unwrap(), Some(uncompressed.clone()));
    assert_eq!(cache.uncompressed_digest(&other).unwrap(), None);

    // A self-relation marks a digest as uncompressed.
    cache.record_digest_uncompressed_pair(&other, &other).unwrap();
    assert_eq!(cache.uncompressed_digest(&other).unwrap(), Some(other.clone()));
}

pub fn record_pair_is_idempotent(new_cache: NewCache) {
    let cache = new_cache();
    let (c, u) = (digest(1), digest(2));

    cache.record_digest_uncompressed_pair(&c, &u).unwrap();
    let first = cache.uncompressed_digest(&c).unwrap();
    cache.record_digest_uncompressed_pair(&c, &u).unwrap();
    assert_eq!(cache.uncompressed_digest(&c).unwrap(), first);
    assert_eq!(cache.stats().unwrap().compression_relations, 1);
}

pub fn record_pair_last_write_wins(new_cache: NewCache) {
    let cache = new_cache();
    let (c, other, u1, u2) = (digest(1), digest(2), digest(10), digest(20));
    let s = scope("app");

    cache.record_digest_uncompressed_pair(&c, &u1).unwrap();
    cache.record_digest_uncompressed_pair(&other, &u1).unwrap();
    cache.record_digest_uncompressed_pair(&c, &u2).unwrap();
    assert_eq!(cache.uncompressed_digest(&c).unwrap(), Some(u2.clone()));
    assert_eq!(cache.stats().unwrap().compression_relations, 2);

    // `c` is no longer an alternate of `other`.
    cache.record_known_location(&s, &c, &loc("c")).unwrap();
    let found = cache
        .candidate_locations(&s, &other, &CandidateOptions::substitutable())
        .unwrap();
    assert!(found.is_empty(), "{found:?}");

    // Once nothing points at u1 it is no longer known as uncompressed.
    cache.record_digest_uncompressed_pair(&other, &u2).unwrap();
    assert_eq!(cache.uncompressed_digest(&u1).unwrap(), None);
    assert_eq!(cache.uncompressed_digest(&u2).unwrap(), Some(u2.clone()));
}

pub fn toc_relations(new_cache: NewCache) {
    let cache = new_cache();
    let (toc, c, u, u2) = (digest(1), digest(2), digest(3), digest(4));

    cache.record_digest_uncompressed_pair(&c, &u).unwrap();
    assert_eq!(cache.uncompressed_digest_for_toc(&toc).unwrap(), None);
    // A blob digest is not a TOC digest.
    assert_eq!(cache.uncompressed_digest_for_toc(&c).unwrap(), None);

    cache.record_toc_uncompressed_pair(&toc, &u).unwrap();
    cache.record_toc_uncompressed_pair(&toc, &u).unwrap();
    assert_eq!(cache.uncompressed_digest_for_toc(&toc).unwrap(), Some(u.clone()));
    assert_eq!(cache.uncompressed_digest(&toc).unwrap(), Some(u.clone()));
    assert_eq!(cache.stats().unwrap().toc_relations, 1);

    cache.record_toc_uncompressed_pair(&toc, &u2).unwrap();
    assert_eq!(cache.uncompressed_digest_for_toc(&toc).unwrap(), Some(u2));
}

pub fn known_locations_insert_or_refresh(new_cache: NewCache) {
    let cache = new_cache();
    let d = digest(1);
    let s = scope("app");

    cache.record_known_location(&s, &d, &loc("first")).unwrap();
    cache.record_known_location(&s, &d, &loc("second")).unwrap();
    let found = cache.candidate_locations(&s, &d, &CandidateOptions::exact()).unwrap();
    assert_eq!(
        summary(&found),
        vec![(d.clone(), "second".to_string()), (d.clone(), "first".to_string())]
    );
    assert!(found[0].last_used > found[1].last_used);

    // Refreshing keeps both and moves the refreshed one first.
    cache.record_known_location(&s, &d, &loc("first")).unwrap();
    let found = cache.candidate_locations(&s, &d, &CandidateOptions::exact()).unwrap();
    assert_eq!(
        summary(&found),
        vec![(d.clone(), "first".to_string()), (d.clone(), "second".to_string())]
    );
    assert_eq!(cache.stats().unwrap().known_locations, 2);
}

pub fn scope_isolation(new_cache: NewCache) {
    let cache = new_cache();
    let (a, b, u) = (digest(1), digest(2), digest(3));
    cache.record_digest_uncompressed_pair(&a, &u).unwrap();
    cache.record_digest_uncompressed_pair(&b, &u).unwrap();

    cache.record_known_location(&scope("one"), &a, &loc("a-in-one")).unwrap();
    cache.record_known_location(&scope("one"), &b, &loc("b-in-one")).unwrap();
    let other_transport = LocationScope::new("oci", "one");

    for options in [CandidateOptions::exact(), CandidateOptions::substitutable()] {
        assert!(cache.candidate_locations(&scope("two"), &a, &options).unwrap().is_empty());
        assert!(cache
            .candidate_locations(&other_transport, &a, &options)
            .unwrap()
            .is_empty());
    }

    cache.record_known_location(&scope("two"), &b, &loc("b-in-two")).unwrap();
    let found = cache
        .candidate_locations(&scope("two"), &a, &CandidateOptions::substitutable())
        .unwrap();
    assert_eq!(summary(&found), vec![(b.clone(), "b-in-two".to_string())]);
}

pub fn exact_match_only_without_substitution(new_cache: NewCache) {
    let cache = new_cache();
    let (a, b, u) = (digest(1), digest(2), digest(3));
    let s = scope("scope1");

    cache.record_digest_uncompressed_pair(&a, &u).unwrap();
    cache.record_digest_uncompressed_pair(&b, &u).unwrap();
    cache.record_known_location(&s, &b, &loc("loc1")).unwrap();
    cache.record_known_location(&s, &u, &loc("plain")).unwrap();

    assert!(cache
        .candidate_locations(&s, &a, &CandidateOptions::exact())
        .unwrap()
        .is_empty());

    let found = cache.candidate_locations(&s, &b, &CandidateOptions::exact()).unwrap();
    assert_eq!(summary(&found), vec![(b.clone(), "loc1".to_string())]);
}

pub fn substitution_finds_alternate_compression(new_cache: NewCache) {
    let cache = new_cache();
    let (a, b, u) = (digest(1), digest(2), digest(3));
    let s = scope("scope1");

    cache.record_digest_uncompressed_pair(&a, &u).unwrap();
    cache.record_digest_uncompressed_pair(&b, &u).unwrap();
    cache.record_known_location(&s, &b, &loc("loc1")).unwrap();

    let found = cache
        .candidate_locations(&s, &a, &CandidateOptions::substitutable())
        .unwrap();
    assert_eq!(summary(&found), vec![(b.clone(), "loc1".to_string())]);
    assert_eq!(found[0].compression, CompressionOperation::PreserveOriginal);

    // The exact digest always ranks first, even when older.
    cache.record_known_location(&s, &a, &loc("loc-a")).unwrap();
    cache.record_known_location(&s, &b, &loc("loc1")).unwrap();
    let found = cache
        .candidate_locations(&s, &a, &CandidateOptions::substitutable())
        .unwrap();
    assert_eq!(
        summary(&found),
        vec![(a.clone(), "loc-a".to_string()), (b.clone(), "loc1".to_string())]
    );
}

pub fn substitution_includes_uncompressed_digest(new_cache: NewCache) {
    let cache = new_cache();
    let (a, u) = (digest(1), digest(2));
    let s = scope("app");

    cache.record_digest_uncompressed_pair(&a, &u).unwrap();
    cache.record_known_location(&s, &u, &loc("plain")).unwrap();

    let found = cache
        .candidate_locations(&s, &a, &CandidateOptions::substitutable())
        .unwrap();
    assert_eq!(summary(&found), vec![(u.clone(), "plain".to_string())]);
    assert_eq!(found[0].compression, CompressionOperation::Decompress);

    // And the other way around: compressed variants of an uncompressed primary.
    cache.record_known_location(&s, &a, &loc("gz")).unwrap();
    let found = cache
        .candidate_locations(&s, &u, &CandidateOptions::substitutable())
        .unwrap();
    assert_eq!(
        summary(&found),
        vec![(u.clone(), "plain".to_string()), (a.clone(), "gz".to_string())]
    );
}

pub fn substitution_through_toc(new_cache: NewCache) {
    let cache = new_cache();
    let (toc, c, u) = (digest(1), digest(2), digest(3));
    let s = scope("app");

    cache.record_toc_uncompressed_pair(&toc, &u).unwrap();
    cache.record_digest_uncompressed_pair(&c, &u).unwrap();
    cache
        .record_digest_compression(&c, BlobCompression::Compressed(CompressionAlgorithm::Zstd))
        .unwrap();
    cache.record_known_location(&s, &c, &loc("zstd")).unwrap();
    cache.record_known_location(&s, &u, &loc("plain")).unwrap();

    assert!(cache
        .candidate_locations(&s, &toc, &CandidateOptions::exact())
        .unwrap()
        .is_empty());

    let found = cache
        .candidate_locations(&s, &toc, &CandidateOptions::substitutable())
        .unwrap();
    assert_eq!(
        summary(&found),
        vec![(u.clone(), "plain".to_string()), (c.clone(), "zstd".to_string())]
    );
    assert_eq!(found[0].compression, CompressionOperation::Decompress);
    assert_eq!(
        found[1].compression,
        CompressionOperation::Compress(CompressionAlgorithm::Zstd)
    );
}

pub fn exact_query_on_uncompressed_digest(new_cache: NewCache) {
    let cache = new_cache();
    let (c, u) = (digest(1), digest(2));
    let s = scope("app");

    cache.record_digest_uncompressed_pair(&c, &u).unwrap();
    cache.record_known_location(&s, &u, &loc("plain")).unwrap();

    for can_substitute in [false, true] {
        let unrestricted = CandidateOptions {
            can_substitute,
            ..CandidateOptions::default()
        };
        let found = cache.candidate_locations(&s, &u, &unrestricted).unwrap();
        assert_eq!(summary(&found), vec![(u.clone(), "plain".to_string())]);
        assert_eq!(found[0].compression, CompressionOperation::Decompress);

        // Schema 1 manifests cannot reference uncompressed layers.
        let schema1 = CandidateOptions {
            can_substitute,
            possible_manifest_formats: vec![ManifestFormat::DockerV2Schema1],
            required_compression: None,
        };
        let found = cache.candidate_locations(&s, &u, &schema1).unwrap();
        assert!(found.is_empty(), "can_substitute={can_substitute}: {found:?}");
    }
}

pub fn manifest_formats_filter_candidates(new_cache: NewCache) {
    let cache = new_cache();
    let (primary, gzip, zstd, unknown, u) = (digest(1), digest(2), digest(3), digest(4), digest(5));
    let s = scope("app");

    for d in [&primary, &gzip, &zstd, &unknown] {
        cache.record_digest_uncompressed_pair(d, &u).unwrap();
    }
    cache
        .record_digest_compression(&gzip, BlobCompression::Compressed(CompressionAlgorithm::Gzip))
        .unwrap();
    cache
        .record_digest_compression(&zstd, BlobCompression::Compressed(CompressionAlgorithm::Zstd))
        .unwrap();
    cache.record_known_location(&s, &gzip, &loc("gzip")).unwrap();
    cache.record_known_location(&s, &zstd, &loc("zstd")).unwrap();
    cache.record_known_location(&s, &unknown, &loc("unknown")).unwrap();
    cache.record_known_location(&s, &u, &loc("plain")).unwrap();

    let query = |formats: Vec<ManifestFormat>| -> HashSet<String> {
        let options = CandidateOptions {
            can_substitute: true,
            possible_manifest_formats: formats,
            required_compression: None,
        };
        cache
            .candidate_locations(&s, &primary, &options)
            .unwrap()
            .into_iter()
            .map(|c| c.location.as_str().to_string())
            .collect()
    };
    let set = |names: &[&str]| -> HashSet<String> { names.iter().map(|n| n.to_string()).collect() };

    assert_eq!(query(vec![]), set(&["gzip", "zstd", "unknown", "plain"]));
    assert_eq!(query(vec![ManifestFormat::OciV1]), set(&["gzip", "zstd", "unknown", "plain"]));
    assert_eq!(
        query(vec![ManifestFormat::DockerV2Schema2]),
        set(&["gzip", "unknown", "plain"])
    );
    assert_eq!(query(vec![ManifestFormat::DockerV2Schema1]), set(&["gzip", "unknown"]));
    assert_eq!(
        query(vec![ManifestFormat::DockerV2Schema1, ManifestFormat::OciV1]),
        set(&["gzip", "zstd", "unknown", "plain"])
    );
}

pub fn required_compression_is_preferred(new_cache: NewCache) {
    let cache = new_cache();
    let (primary, gzip, zstd, chunked, unknown, u) =
        (digest(1), digest(2), digest(3), digest(4), digest(5), digest(6));
    let s = scope("app");

    for d in [&primary, &gzip, &zstd, &chunked, &unknown] {
        cache.record_digest_uncompressed_pair(d, &u).unwrap();
    }
    cache
        .record_digest_compression(&gzip, BlobCompression::Compressed(CompressionAlgorithm::Gzip))
        .unwrap();
    cache
        .record_digest_compression(&zstd, BlobCompression::Compressed(CompressionAlgorithm::Zstd))
        .unwrap();
    cache
        .record_digest_compression(
            &chunked,
            BlobCompression::Compressed(CompressionAlgorithm::ZstdChunked),
        )
        .unwrap();
    // Recorded oldest to newest.
    cache.record_known_location(&s, &zstd, &loc("zstd")).unwrap();
    cache.record_known_location(&s, &chunked, &loc("chunked")).unwrap();
    cache.record_known_location(&s, &primary, &loc("primary")).unwrap();
    cache.record_known_location(&s, &gzip, &loc("gzip")).unwrap();
    cache.record_known_location(&s, &unknown, &loc("unknown")).unwrap();

    let locations = |required: Option<CompressionAlgorithm>| -> Vec<String> {
        let options = CandidateOptions {
            can_substitute: true,
            possible_manifest_formats: vec![],
            required_compression: required,
        };
        cache
            .candidate_locations(&s, &primary, &options)
            .unwrap()
            .into_iter()
            .map(|c| c.location.as_str().to_string())
            .collect()
    };

    assert_eq!(locations(None), ["primary", "unknown", "gzip", "chunked", "zstd"]);
    assert_eq!(
        locations(Some(CompressionAlgorithm::Zstd)),
        ["primary", "chunked", "zstd", "unknown", "gzip"]
    );
    assert_eq!(
        locations(Some(CompressionAlgorithm::ZstdChunked)),
        ["primary", "chunked", "unknown", "gzip", "zstd"]
    );
    assert_eq!(
        locations(Some(CompressionAlgorithm::Gzip)),
        ["primary", "gzip", "unknown", "chunked", "zstd"]
    );
}

pub fn compression_records(new_cache: NewCache) {
    let cache = new_cache();
    let (primary, d, u) = (digest(1), digest(2), digest(3));
    let s = scope("app");

    cache.record_digest_uncompressed_pair(&primary, &u).unwrap();
    cache.record_digest_uncompressed_pair(&d, &u).unwrap();
    cache.record_known_location(&s, &d, &loc("l")).unwrap();

    let operation = || {
        cache
            .candidate_locations(&s, &primary, &CandidateOptions::substitutable())
            .unwrap()[0]
            .compression
    };

    assert_eq!(operation(), CompressionOperation::PreserveOriginal);

    cache
        .record_digest_compression(&d, BlobCompression::Compressed(CompressionAlgorithm::Gzip))
        .unwrap();
    assert_eq!(operation(), CompressionOperation::Compress(CompressionAlgorithm::Gzip));

    // Unknown does not erase what is known.
    cache.record_digest_compression(&d, BlobCompression::Unknown).unwrap();
    assert_eq!(operation(), CompressionOperation::Compress(CompressionAlgorithm::Gzip));

    // A different known value replaces it.
    cache
        .record_digest_compression(&d, BlobCompression::Compressed(CompressionAlgorithm::Zstd))
        .unwrap();
    assert_eq!(operation(), CompressionOperation::Compress(CompressionAlgorithm::Zstd));

    cache.record_digest_compression(&d, BlobCompression::Uncompressed).unwrap();
    assert_eq!(operation(), CompressionOperation::Decompress);
    assert_eq!(cache.stats().unwrap().digest_compressions, 1);
}

pub fn bounded_output(new_cache: NewCache) {
    let cache = new_cache();
    let (primary, u) = (digest(1), digest(2));
    let s = scope("app");

    cache.record_digest_uncompressed_pair(&primary, &u).unwrap();
    for i in 0..10 {
        let d = digest(100 + i);
        cache.record_digest_uncompressed_pair(&d, &u).unwrap();
        for j in 0..3 {
            cache.record_known_location(&s, &d, &loc(&format!("{i}-{j}"))).unwrap();
        }
    }
    for j in 0..10 {
        cache.record_known_location(&s, &primary, &loc(&format!("p-{j}"))).unwrap();
    }

    for options in [CandidateOptions::exact(), CandidateOptions::substitutable()] {
        let found = cache.candidate_locations(&s, &primary, &options).unwrap();
        assert_eq!(found.len(), DEFAULT_MAX_CANDIDATES);
        // Newest exact-match locations fill the list.
        assert_eq!(found[0].location.as_str(), "p-9");
        assert!(found.iter().all(|c| c.digest == primary));
    }
}

pub fn deterministic_order(new_cache: NewCache) {
    let cache = new_cache();
    let u = digest(1);
    let s = scope("app");

    for i in 2..6 {
        let d = digest(i);
        cache.record_digest_uncompressed_pair(&d, &u).unwrap();
        cache.record_known_location(&s, &d, &loc(&format!("l{i}"))).unwrap();
    }

    let options = CandidateOptions::substitutable();
    let first = cache.candidate_locations(&s, &digest(2), &options).unwrap();
    let second = cache.candidate_locations(&s, &digest(2), &options).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        summary(&first),
        vec![
            (digest(2), "l2".to_string()),
            (digest(5), "l5".to_string()),
            (digest(4), "l4".to_string()),
            (digest(3), "l3".to_string()),
        ]
    );
}

pub fn concurrent_records_and_queries(new_cache: NewCache) {
    const WRITERS: u32 = 4;
    const READERS: u32 = 4;
    const PER_WRITER: u32 = 20;

    let cache = new_cache();
    let cache: &dyn BlobInfoCache = &*cache;
    let u = digest(1);
    let s = scope("app");
    let primary = digest(2);
    cache.record_digest_uncompressed_pair(&primary, &u).unwrap();

    let written = |w: u32, i: u32| digest(1000 + w * PER_WRITER + i);

    std::thread::scope(|scope| {
        for w in 0..WRITERS {
            let (u, s) = (&u, &s);
            scope.spawn(move || {
                for i in 0..PER_WRITER {
                    let d = written(w, i);
                    cache.record_digest_uncompressed_pair(&d, u).unwrap();
                    cache.record_known_location(s, &d, &loc(&format!("w{w}-{i}"))).unwrap();
                }
            });
        }
        for _ in 0..READERS {
            let (u, s, primary) = (&u, &s, &primary);
            scope.spawn(move || {
                for _ in 0..PER_WRITER {
                    let found = cache
                        .candidate_locations(s, primary, &CandidateOptions::substitutable())
                        .unwrap();
                    assert!(found.len() <= DEFAULT_MAX_CANDIDATES);
                    for c in found {
                        // A location is only visible together with its relation.
                        assert_eq!(cache.uncompressed_digest(&c.digest).unwrap().as_ref(), Some(u));
                        assert!(c.location.as_str().starts_with('w'));
                    }
                }
            });
        }
    });

    for w in 0..WRITERS {
        for i in 0..PER_WRITER {
            assert_eq!(cache.uncompressed_digest(&written(w, i)).unwrap(), Some(u.clone()));
        }
    }
    let stats = cache.stats().unwrap();
    assert_eq!(stats.compression_relations, (WRITERS * PER_WRITER + 1) as usize);
    assert_eq!(stats.known_locations, (WRITERS * PER_WRITER) as usize);
    assert_eq!(
        cache
            .candidate_locations(&s, &primary, &CandidateOptions::substitutable())
            .unwrap()
            .len(),
        DEFAULT_MAX_CANDIDATES
    );
}
