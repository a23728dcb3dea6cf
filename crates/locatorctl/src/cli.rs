//! Exposes the command line application.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use locator_cache::caching::{CacheName, LocatorCaches, PreloadItem};
use locator_cache::config::Config;
use locator_cache::resolver::{HttpResolver, OfflineResolver, Resolver};
use locator_cache::{CacheStats, SweepStats, metrics};
use serde::Serialize;

use crate::logging;

/// The cache to operate on.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum CacheArg {
    Products,
    Stories,
}

impl From<CacheArg> for CacheName {
    fn from(arg: CacheArg) -> Self {
        match arg {
            CacheArg::Products => CacheName::Products,
            CacheArg::Stories => CacheName::Stories,
        }
    }
}

/// Locatorctl commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve the locator of a single entity.
    Resolve {
        /// The cache to resolve into.
        #[arg(long, value_enum, default_value = "products")]
        cache: CacheArg,

        /// The entity id.
        id: String,

        /// The storage key of the entity's image.
        source_key: String,
    },

    /// Resolve the locators of a batch of entities.
    ///
    /// The batch is a JSON array of `{"id": ..., "source_key": ...}` objects.
    Preload {
        /// The cache to resolve into.
        #[arg(long, value_enum, default_value = "products")]
        cache: CacheArg,

        /// How many locators to resolve at once. Defaults to the configured concurrency.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Path to the batch, or `-` to read it from stdin.
        #[arg(value_name = "FILE")]
        items: PathBuf,
    },

    /// Evict expired locators from the persisted caches.
    Sweep {
        /// Only sweep this cache.
        #[arg(long, value_enum)]
        cache: Option<CacheArg>,

        /// Also evict every entity that is not listed.
        ///
        /// Requires `--cache`.
        #[arg(long = "active", value_name = "ID", requires = "cache")]
        active_ids: Option<Vec<String>>,
    },

    /// Print the number of persisted locators.
    Stats,
}

impl Command {
    /// Whether the command may resolve locators, and thus needs a resolver.
    fn resolves(&self) -> bool {
        matches!(self, Self::Resolve { .. } | Self::Preload { .. })
    }
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("locatorctl")
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(run(cli.command, config))
}

fn create_resolver(command: &Command, config: &Config) -> Result<Arc<dyn Resolver>> {
    let resolver =
        HttpResolver::from_config(&config.resolver).context("failed to create resolver")?;
    match resolver {
        Some(resolver) => Ok(Arc::new(resolver)),
        None if command.resolves() => anyhow::bail!("no resolver url configured"),
        None => Ok(Arc::new(OfflineResolver)),
    }
}

async fn run(command: Command, config: Config) -> Result<()> {
    let resolver = create_resolver(&command, &config)?;
    let caches = LocatorCaches::from_config(&config, resolver)
        .context("failed to open the cache directory")?;

    match command {
        Command::Resolve {
            cache,
            id,
            source_key,
        } => {
            let cache = caches.get(cache.into());
            let locator = cache.get_locator(&id, &source_key).await;
            print_json(&Resolved {
                id: &id,
                locator: &locator,
                is_placeholder: locator == cache.placeholder(),
            })
        }
        Command::Preload {
            cache,
            concurrency,
            items,
        } => {
            let items = read_items(&items)?;
            let _sweeps = caches.spawn_periodic_sweeps(config.sweep_interval);
            let cache = caches.get(cache.into());

            tracing::info!(cache = %cache.name(), items = items.len(), "Preloading locators");
            cache.preload(items, concurrency).await;
            print_json(&named_stats(&caches))
        }
        Command::Sweep {
            cache: Some(cache),
            active_ids: Some(active_ids),
        } => {
            let name = cache.into();
            let stats = caches.get(name).sweep(&active_ids);
            print_json(&BTreeMap::from([(name.to_string(), stats)]))
        }
        Command::Sweep {
            cache: Some(cache),
            active_ids: None,
        } => {
            let name = cache.into();
            let stats = caches.get(name).remove_expired();
            print_json(&BTreeMap::from([(name.to_string(), stats)]))
        }
        Command::Sweep { cache: None, .. } => {
            let stats: BTreeMap<String, SweepStats> = caches
                .remove_expired()
                .into_iter()
                .map(|(name, stats)| (name.to_string(), stats))
                .collect();
            print_json(&stats)
        }
        Command::Stats => print_json(&named_stats(&caches)),
    }
}

#[derive(Debug, Serialize)]
struct Resolved<'a> {
    id: &'a str,
    locator: &'a str,
    is_placeholder: bool,
}

fn named_stats(caches: &LocatorCaches) -> BTreeMap<String, CacheStats> {
    [CacheName::Products, CacheName::Stories]
        .into_iter()
        .map(|name| (name.to_string(), caches.get(name).stats()))
        .collect()
}

fn read_items(path: &Path) -> Result<Vec<PreloadItem>> {
    let reader: Box<dyn Read> = if path == Path::new("-") {
        Box::new(io::stdin().lock())
    } else {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Box::new(BufReader::new(file))
    };
    serde_json::from_reader(reader).context("failed to parse preload items")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = io::stdout().lock();
    serde_json::to_writer_pretty(stdout, value).context("failed to write output")?;
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sweep() {
        let cli = Cli::try_parse_from([
            "locatorctl", "sweep", "--cache", "stories", "--active", "s1", "--active", "s2",
        ])
        .unwrap();
        let Command::Sweep { cache, active_ids } = cli.command else {
            panic!("expected sweep");
        };
        assert!(matches!(cache, Some(CacheArg::Stories)));
        assert_eq!(active_ids.unwrap(), ["s1", "s2"]);

        // an active set without a cache is ambiguous
        assert!(Cli::try_parse_from(["locatorctl", "sweep", "--active", "s1"]).is_err());
    }

    #[test]
    fn test_resolver_only_required_for_resolving() {
        let config = Config::default();

        let stats = Cli::try_parse_from(["locatorctl", "stats"]).unwrap();
        assert!(create_resolver(&stats.command, &config).is_ok());
        let sweep = Cli::try_parse_from(["locatorctl", "sweep"]).unwrap();
        assert!(create_resolver(&sweep.command, &config).is_ok());

        let resolve = Cli::try_parse_from(["locatorctl", "resolve", "p1", "a.png"]).unwrap();
        assert!(create_resolver(&resolve.command, &config).is_err());
    }

    #[test]
    fn test_read_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.json");
        std::fs::write(
            &path,
            r#"[{"id": "p1", "source_key": "products/a.png"}, {"id": "p2", "imageUrl": ""}]"#,
        )
        .unwrap();

        let items = read_items(&path).unwrap();
        assert_eq!(
            items,
            [
                PreloadItem::new("p1", "products/a.png"),
                PreloadItem::new("p2", ""),
            ]
        );
    }
}
