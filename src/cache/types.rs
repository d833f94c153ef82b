//! Value types shared by every cache backend.
//!
//! Relations name digests by value; scopes, location references and
//! timestamps are plain data so both backends can store them identically.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;

/// Failure to parse one of the named enums below.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} {value:?}")]
pub struct ParseNameError {
    pub kind: &'static str,
    pub value: String,
}

/// The (transport, scope) boundary a location is usable within.
///
/// A blob known in one scope is never offered for another: the transfer
/// engine may have no credentials or route to it there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationScope {
    /// Transport name, e.g. `docker`.
    pub transport: String,
    /// Transport-defined scope, e.g. `registry.example.com/library/busybox`.
    pub scope: String,
}

impl LocationScope {
    pub fn new(transport: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            scope: scope.into(),
        }
    }
}

impl fmt::Display for LocationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.scope)
    }
}

/// Opaque, transport-defined token for where inside a scope a blob was seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationReference(String);

impl LocationReference {
    pub fn new(opaque: impl Into<String>) -> Self {
        Self(opaque.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last-used time of a location, in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
            .unwrap_or(0);
        Self(nanos)
    }

    /// The current time, forced to be strictly later than `previous`.
    ///
    /// Each cache feeds its latest stamp back in, so two records made in the
    /// same clock tick (or across a clock step backwards) still order.
    pub fn next_after(previous: Option<Timestamp>) -> Self {
        let now = Self::now();
        match previous {
            Some(prev) if prev >= now => Self(prev.0.saturating_add(1)),
            _ => now,
        }
    }
}

/// One place a digest has been seen within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownLocation {
    pub location: LocationReference,
    pub last_used: Timestamp,
}

/// A compression algorithm a blob may be stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "zstd")]
    Zstd,
    /// zstd with an embedded table of contents for lazy pulling.
    #[serde(rename = "zstd:chunked")]
    ZstdChunked,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::ZstdChunked => "zstd:chunked",
        }
    }

    /// The algorithm a plain decompressor needs for this variant.
    pub fn base_variant(&self) -> CompressionAlgorithm {
        match self {
            CompressionAlgorithm::ZstdChunked => CompressionAlgorithm::Zstd,
            other => *other,
        }
    }

    /// Whether a blob compressed with `self` satisfies a requirement for
    /// `required`. A base-variant requirement accepts any of its variants; a
    /// specific variant requires an exact match.
    pub fn satisfies(&self, required: CompressionAlgorithm) -> bool {
        if required.base_variant() != required {
            *self == required
        } else {
            self.base_variant() == required
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(CompressionAlgorithm::Gzip),
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            "zstd:chunked" => Ok(CompressionAlgorithm::ZstdChunked),
            other => Err(ParseNameError {
                kind: "compression algorithm",
                value: other.to_string(),
            }),
        }
    }
}

/// What the cache knows about how a particular blob is compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobCompression {
    Uncompressed,
    Compressed(CompressionAlgorithm),
    Unknown,
}

impl BlobCompression {
    /// Stable name used by the persistent backend and the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            BlobCompression::Uncompressed => "uncompressed",
            BlobCompression::Compressed(alg) => alg.name(),
            BlobCompression::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, BlobCompression::Unknown)
    }

    /// Whether this blob satisfies a required compression. Unknown and
    /// uncompressed blobs never do.
    pub fn satisfies(&self, required: CompressionAlgorithm) -> bool {
        match self {
            BlobCompression::Compressed(alg) => alg.satisfies(required),
            _ => false,
        }
    }

    /// The operation that produced a blob in this state from its
    /// uncompressed content.
    pub fn operation(&self) -> CompressionOperation {
        match self {
            BlobCompression::Uncompressed => CompressionOperation::Decompress,
            BlobCompression::Compressed(alg) => CompressionOperation::Compress(*alg),
            BlobCompression::Unknown => CompressionOperation::PreserveOriginal,
        }
    }
}

impl fmt::Display for BlobCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BlobCompression {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncompressed" => Ok(BlobCompression::Uncompressed),
            "unknown" => Ok(BlobCompression::Unknown),
            other => other
                .parse::<CompressionAlgorithm>()
                .map(BlobCompression::Compressed)
                .map_err(|_| ParseNameError {
                    kind: "blob compression",
                    value: other.to_string(),
                }),
        }
    }
}

/// Manifest formats a destination image may be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManifestFormat {
    #[serde(rename = "docker-v2s1")]
    DockerV2Schema1,
    #[serde(rename = "docker-v2s2")]
    DockerV2Schema2,
    #[serde(rename = "oci-v1")]
    OciV1,
}

impl ManifestFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ManifestFormat::DockerV2Schema1 => "docker-v2s1",
            ManifestFormat::DockerV2Schema2 => "docker-v2s2",
            ManifestFormat::OciV1 => "oci-v1",
        }
    }

    /// Whether layers with `compression` can be referenced from this format.
    /// Unknown compression is not decided here.
    pub fn accepts(&self, compression: &BlobCompression) -> bool {
        use CompressionAlgorithm::*;
        match (self, compression) {
            (_, BlobCompression::Unknown) => true,
            (ManifestFormat::DockerV2Schema1, BlobCompression::Compressed(Gzip)) => true,
            (ManifestFormat::DockerV2Schema1, _) => false,
            (ManifestFormat::DockerV2Schema2, BlobCompression::Uncompressed) => true,
            (ManifestFormat::DockerV2Schema2, BlobCompression::Compressed(Gzip)) => true,
            (ManifestFormat::DockerV2Schema2, _) => false,
            (ManifestFormat::OciV1, _) => true,
        }
    }
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ManifestFormat {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker-v2s1" => Ok(ManifestFormat::DockerV2Schema1),
            "docker-v2s2" => Ok(ManifestFormat::DockerV2Schema2),
            "oci-v1" => Ok(ManifestFormat::OciV1),
            other => Err(ParseNameError {
                kind: "manifest format",
                value: other.to_string(),
            }),
        }
    }
}

/// Options for a candidate query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateOptions {
    /// Allow differently-compressed blobs with the same uncompressed content.
    /// When false only exact digest matches are returned.
    pub can_substitute: bool,

    /// Formats the destination manifest may use. Empty means unrestricted.
    pub possible_manifest_formats: Vec<ManifestFormat>,

    /// Preferred compression; matching candidates rank first after exact
    /// digest matches.
    pub required_compression: Option<CompressionAlgorithm>,
}

impl CandidateOptions {
    /// Exact digest matches only.
    pub fn exact() -> Self {
        Self::default()
    }

    /// Exact matches and substitutes with the same uncompressed content.
    pub fn substitutable() -> Self {
        Self {
            can_substitute: true,
            ..Self::default()
        }
    }
}

/// How a candidate blob relates to its uncompressed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionOperation {
    /// Compression unknown; the blob must be used as-is.
    PreserveOriginal,
    /// The blob is its content compressed with the algorithm.
    Compress(CompressionAlgorithm),
    /// The blob is uncompressed content.
    Decompress,
}

/// A ranked suggestion that a known location can stand in for a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub digest: Digest,
    pub location: LocationReference,
    pub compression: CompressionOperation,
    pub last_used: Timestamp,
}
