use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;

use fpcache::cache::{self, PageCache};
use fpcache::cli::{Cli, Command};
use fpcache::{logging, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log)?;
    let cache = PageCache::new(settings.cache_options())?;

    match &cli.command {
        Command::Sweep { watch: false } => {
            // One-shot runs are the cron entry point; they must reach every
            // shard, so the batch bound only applies to the periodic sweeper.
            let stats = cache.sweep()?;
            info!(scanned = stats.scanned, deleted = stats.deleted, "sweep finished");
        }
        Command::Sweep { watch: true } => {
            info!(
                interval = settings.sweep_interval,
                batch_size = settings.sweep_batch_size,
                "sweeping continuously"
            );
            cache::spawn_sweeper(
                Arc::new(cache),
                settings.sweep_interval(),
                settings.sweep_batch_size,
            );
            std::future::pending::<()>().await;
        }
        Command::Invalidate { tags } => {
            let tags: BTreeSet<String> = tags.iter().cloned().collect();
            if !cache.invalidate_tags(&tags)? {
                bail!("ledger is busy; invalidations not recorded");
            }
            info!(tags = tags.len(), "invalidations recorded");
        }
        Command::Stats => {
            let stats = cache.tree_stats()?;
            info!(shards = stats.shards, entries = stats.entries, "cache tree");
        }
    }

    Ok(())
}
