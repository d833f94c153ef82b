use std::path::Path;

use clap::Parser;
use tracing::{error, info};

use blob_info_cache::cache::types::{CandidateOptions, LocationReference, LocationScope};
use blob_info_cache::cache::{open_cache, BlobInfoCache};
use blob_info_cache::config::{Cli, Command, Config, ScopeArgs};
use blob_info_cache::digest::registry::DigestRegistry;
use blob_info_cache::digest::Algorithm;

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Logs go to stderr; stdout carries results.
    let filter = if cli.verbose {
        "blob_info_cache=debug"
    } else {
        "blob_info_cache=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("blob-info-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    let registry = DigestRegistry::with_algorithm(&Algorithm::new(
        config.digests.algorithm_for_new_objects.as_str(),
    ))?;

    // Hashing a file needs no cache.
    if let Command::Digest { file } = &cli.command {
        return print_digest(&registry, file);
    }

    let cache = open_cache(&config.cache)?;

    // Close on every path; a failed command still releases the database.
    let result = run(&cli.command, cache.as_ref(), &registry);
    if let Err(e) = cache.close() {
        error!(error = %e, "Failed to close cache");
        result?;
        return Err(e.into());
    }
    result
}

fn scope_of(args: &ScopeArgs) -> LocationScope {
    LocationScope::new(args.transport.as_str(), args.scope.as_str())
}

fn print_digest(registry: &DigestRegistry, file: &Path) -> anyhow::Result<()> {
    let data = std::fs::read(file)?;
    println!("{}", registry.digest_for_new_object(&data)?);
    Ok(())
}

fn run(command: &Command, cache: &dyn BlobInfoCache, registry: &DigestRegistry) -> anyhow::Result<()> {
    match command {
        Command::RecordPair {
            compressed,
            uncompressed,
        } => cache.record_digest_uncompressed_pair(compressed, uncompressed)?,

        Command::RecordToc { toc, uncompressed } => {
            cache.record_toc_uncompressed_pair(toc, uncompressed)?
        }

        Command::RecordCompression {
            digest,
            compression,
        } => cache.record_digest_compression(digest, *compression)?,

        Command::RecordLocation {
            scope,
            digest,
            location,
        } => cache.record_known_location(
            &scope_of(scope),
            digest,
            &LocationReference::new(location.as_str()),
        )?,

        Command::Uncompressed { digest, toc } => {
            let found = if *toc {
                cache.uncompressed_digest_for_toc(digest)?
            } else {
                cache.uncompressed_digest(digest)?
            };
            match found {
                Some(d) => println!("{d}"),
                None => info!(digest = %digest, "Uncompressed digest not known"),
            }
        }

        Command::Candidates {
            scope,
            digest,
            substitute,
            formats,
            require,
        } => {
            let options = CandidateOptions {
                can_substitute: *substitute,
                possible_manifest_formats: formats.clone(),
                required_compression: *require,
            };
            let candidates = cache.candidate_locations(&scope_of(scope), digest, &options)?;
            println!("{}", serde_json::to_string_pretty(&candidates)?);
        }

        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&cache.stats()?)?);
        }

        Command::Digest { file } => print_digest(registry, file)?,
    }
    Ok(())
}
