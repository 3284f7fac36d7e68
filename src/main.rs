//! petraclient - command-line access to a memcached cluster
//!
//! ```text
//! petraclient [--config FILE] <command> [args...]
//!
//!   get KEY...             print the values found
//!   set KEY VALUE [TTL]    store a string (digits are stored as a number)
//!   delete KEY...          delete keys
//!   incr KEY [DELTA]       increment a counter
//!   decr KEY [DELTA]       decrement a counter, clamping at 0
//!   stats                  per-server statistics
//!   flush                  expire everything on every server
//!   servers                server status
//! ```
//!
//! Without `--config`, settings come from `PETRACLIENT_*` environment
//! variables.

// Use jemalloc for better multi-threaded performance (10-30% throughput improvement)
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use anyhow::{Context, bail};
use petraclient::config::Config;
use petraclient::{Client, Value};
use tokio::runtime::Builder;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: petraclient [--config FILE] <get|set|delete|incr|decr|stats|flush|servers> [args...]";

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();

    // Load configuration
    let config = if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            bail!(USAGE);
        }
        let path = args.remove(1);
        args.remove(0);
        info!("Loading configuration from {}", path);
        Config::from_file(&path)?
    } else {
        debug!("Using environment configuration (set PETRACLIENT_* env vars to customize)");
        Config::from_env()
    };

    let Some(command) = args.first().cloned() else {
        bail!(USAGE);
    };
    let rest = args.split_off(1);

    // A single-threaded runtime is plenty: the client never spawns
    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(run(config, &command, &rest))
}

async fn run(config: Config, command: &str, args: &[String]) -> anyhow::Result<()> {
    let client = Client::new(&config)?;

    match (command, args) {
        ("get", keys) if !keys.is_empty() => {
            let found = client.get_multi(keys.iter()).await?;
            for key in keys {
                match found.get(key) {
                    Some(value) => println!("{key}: {value}"),
                    None => println!("{key}: (miss)"),
                }
            }
        }
        ("set", [key, value, ttl @ ..]) if ttl.len() <= 1 => {
            let ttl = match ttl.first() {
                Some(t) => t.parse().context("TTL must be a number of seconds")?,
                None => 0,
            };
            let value = match value.parse::<i64>() {
                Ok(n) => Value::Int(n),
                Err(_) => Value::Str(value.clone()),
            };
            println!("{}", stored(client.set(key, value, ttl).await?));
        }
        ("delete", keys) if !keys.is_empty() => {
            let deleted = client.delete_many(keys.iter()).await?;
            for key in keys {
                let ok = deleted.get(key).copied().unwrap_or(false);
                println!("{key}: {}", if ok { "DELETED" } else { "NOT_FOUND" });
            }
        }
        ("incr" | "decr", [key, delta @ ..]) if delta.len() <= 1 => {
            let delta = match delta.first() {
                Some(d) => d.parse().context("delta must be a non-negative integer")?,
                None => 1,
            };
            let result = if command == "incr" {
                client.incr(key, delta).await?
            } else {
                client.decr(key, delta).await?
            };
            match result {
                Some(n) => println!("{n}"),
                None => println!("NOT_FOUND"),
            }
        }
        ("stats", []) => {
            let Some(stats) = client.server_stats().await else {
                bail!("stats are not available on a delete-only client");
            };
            let mut servers: Vec<_> = stats.into_iter().collect();
            servers.sort_by(|a, b| a.0.cmp(&b.0));
            for (server, stats) in servers {
                println!("{server}");
                for (name, value) in stats {
                    println!("  {name:<24} {value:?}");
                }
            }
        }
        ("flush", []) => match client.flush_all().await? {
            Some(true) => println!("OK"),
            Some(false) => println!("FAILED"),
            None => println!("NO SERVERS"),
        },
        ("servers", []) => {
            for line in client.servers() {
                println!("{line}");
            }
        }
        _ => bail!(USAGE),
    }

    client.close();
    Ok(())
}

fn stored(ok: bool) -> &'static str {
    if ok { "STORED" } else { "NOT_STORED" }
}
