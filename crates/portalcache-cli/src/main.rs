//! portalcache - operator tool for the portal's response cache.
//!
//! Opens the same cache directory the portal uses, runs the schema version
//! gate, and lets an operator inspect or clear entries.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use portalcache_core::{CacheConfig, CacheService, GateOutcome, CACHE_SCHEMA_VERSION};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directory for an additional daily-rolling log file
const ENV_LOG_DIR: &str = "PORTALCACHE_LOG_DIR";

/// Log file prefix inside the log directory
const LOG_FILE_PREFIX: &str = "portalcache.log";

const USAGE: &str = "\
Usage: portalcache <command>

Commands:
  stats                       Print cache counters and entry counts
  inspect <key>               Show metadata for a cached key
  get <key>                   Print the cached JSON value for a key
  set <key> <json> [ttl_ms]   Store a JSON value (default TTL from config)
  remove <key>                Drop one key from every tier
  clear                       Wipe every tier
  clear-type <label>          Wipe entries generated for a type label
  prune                       Remove expired entries
  key <label> <json>          Print the key generated for a parameter bag";

/// Initialize the tracing subscriber for logging.
/// The returned guard must live until exit so the file writer flushes.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }
    if command == "key" {
        let (label, params) = two_args(&args, "key <label> <json>")?;
        let params: serde_json::Value =
            serde_json::from_str(params).context("Parameters must be valid JSON")?;
        println!("{}", portalcache_core::generate_key(label, &params));
        return Ok(());
    }

    let config = CacheConfig::load().context("Failed to load cache config")?;
    let cache = CacheService::open(&config, CACHE_SCHEMA_VERSION).await;
    if let GateOutcome::Reset { previous } = cache.gate_outcome() {
        info!(?previous, current = CACHE_SCHEMA_VERSION, "Cache was reset by the version gate");
    }

    match command {
        "stats" => print_json(&cache.stats())?,
        "inspect" => {
            let key = one_arg(&args, "inspect <key>")?;
            match cache.inspect(key) {
                Some(info) => print_json(&info)?,
                None => eprintln!("Not cached: {}", key),
            }
        }
        "get" => {
            let key = one_arg(&args, "get <key>")?;
            match cache.get_async::<serde_json::Value>(key).await {
                Some(value) => print_json(&value)?,
                None => eprintln!("Not cached: {}", key),
            }
        }
        "set" => {
            let (key, raw) = two_args(&args, "set <key> <json> [ttl_ms]")?;
            let value: serde_json::Value =
                serde_json::from_str(raw).context("Value must be valid JSON")?;
            let ttl = match args.get(3) {
                Some(ms) => Duration::from_millis(ms.parse().context("TTL must be milliseconds")?),
                None => cache.default_ttl(),
            };
            cache.set_async(key, &value, ttl).await;
            eprintln!("Stored {} for {}ms", key, ttl.as_millis());
        }
        "remove" => {
            let key = one_arg(&args, "remove <key>")?;
            cache.remove_async(key).await;
            eprintln!("Removed {}", key);
        }
        "clear" => {
            let removed = cache.clear_all().await;
            eprintln!("Cleared {} entries", removed);
        }
        "clear-type" => {
            let label = one_arg(&args, "clear-type <label>")?;
            let removed = cache.clear_by_type_async(label).await;
            eprintln!("Cleared {} '{}' entries", removed, label);
        }
        "prune" => {
            let removed = cache.prune_expired();
            eprintln!("Pruned {} expired entries", removed);
        }
        other => anyhow::bail!("Unknown command: {}\n\n{}", other, USAGE),
    }

    Ok(())
}

fn one_arg<'a>(args: &'a [String], usage: &str) -> Result<&'a str> {
    args.get(1)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("Usage: portalcache {}", usage))
}

fn two_args<'a>(args: &'a [String], usage: &str) -> Result<(&'a str, &'a str)> {
    match (args.get(1), args.get(2)) {
        (Some(a), Some(b)) => Ok((a.as_str(), b.as_str())),
        _ => Err(anyhow::anyhow!("Usage: portalcache {}", usage)),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
