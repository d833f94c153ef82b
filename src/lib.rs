//! blob-info-cache: remembers where container image blobs have been seen.
//!
//! Records digest equivalences (compressed vs. uncompressed content,
//! table-of-contents digests) and per-scope blob locations, and answers
//! "which known blob could stand in for the one about to be transferred"
//! with a short, ranked candidate list. Two interchangeable backends share
//! one contract: an in-memory cache and a persistent SQLite cache.

pub mod cache;
pub mod config;
pub mod digest;
