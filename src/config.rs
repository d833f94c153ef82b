//! Runtime configuration for blob-info-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Command-line flags override the file.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::candidates::DEFAULT_MAX_CANDIDATES;
use crate::cache::types::{BlobCompression, CompressionAlgorithm, ManifestFormat};
use crate::digest::Digest;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "blob-info-cache", about = "Inspect and update a blob info cache")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "blob-info-cache.json")]
    pub config: PathBuf,

    /// Cache database path (overrides the configuration file).
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Use a throwaway in-memory cache instead of the database.
    #[arg(long, conflicts_with = "db")]
    pub memory: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Record that a compressed blob decompresses to an uncompressed one.
    RecordPair {
        #[arg(long)]
        compressed: Digest,
        #[arg(long)]
        uncompressed: Digest,
    },

    /// Record the uncompressed digest indexed by a table-of-contents digest.
    RecordToc {
        #[arg(long)]
        toc: Digest,
        #[arg(long)]
        uncompressed: Digest,
    },

    /// Record how a blob is compressed.
    RecordCompression {
        #[arg(long)]
        digest: Digest,
        /// uncompressed, gzip, zstd, zstd:chunked or unknown.
        #[arg(long)]
        compression: BlobCompression,
    },

    /// Record (or refresh) a location a blob was seen at.
    RecordLocation {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        digest: Digest,
        #[arg(long)]
        location: String,
    },

    /// Print the uncompressed digest of a blob, if known.
    Uncompressed {
        digest: Digest,
        /// Treat the digest as a table-of-contents digest.
        #[arg(long)]
        toc: bool,
    },

    /// Print ranked reuse candidates for a blob as JSON.
    Candidates {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        digest: Digest,
        /// Allow differently-compressed blobs with the same content.
        #[arg(long)]
        substitute: bool,
        /// Manifest formats the destination may use (repeatable).
        #[arg(long = "format")]
        formats: Vec<ManifestFormat>,
        /// Prefer candidates with this compression.
        #[arg(long)]
        require: Option<CompressionAlgorithm>,
    },

    /// Print entry counts as JSON.
    Stats,

    /// Compute the digest of a file with the configured algorithm.
    Digest { file: PathBuf },
}

/// Transport and scope selecting a location group.
#[derive(Args, Debug, Clone)]
pub struct ScopeArgs {
    #[arg(long)]
    pub transport: String,
    #[arg(long)]
    pub scope: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache backend settings.
    pub cache: CacheConfig,

    /// Digest algorithm settings.
    pub digests: DigestConfig,
}

/// Which backend stores the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-lifetime maps; nothing survives a restart.
    Memory,
    /// SQLite database file at `path`.
    Sqlite,
}

/// Cache backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: BackendKind,

    /// Database file for the SQLite backend.
    pub path: PathBuf,

    /// Maximum number of candidates a query returns.
    pub max_candidates: usize,

    /// How long a SQLite operation waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            path: PathBuf::from("/var/lib/containers/cache/blob-info-cache.sqlite"),
            max_candidates: DEFAULT_MAX_CANDIDATES,
            busy_timeout_ms: 10_000,
        }
    }
}

/// Digest algorithm settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    /// Algorithm for newly created content ("sha256" or "sha512").
    pub algorithm_for_new_objects: String,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            algorithm_for_new_objects: "sha256".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.memory {
            self.cache.backend = BackendKind::Memory;
        } else if let Some(db) = &cli.db {
            self.cache.backend = BackendKind::Sqlite;
            self.cache.path = db.clone();
        }
    }
}
