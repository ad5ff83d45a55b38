use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "fpcache", about = "Full-page cache maintenance tool")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./fpcache.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Delete expired entries from the cache tree.
    Sweep {
        /// Keep running, sweeping every sweep_interval seconds.
        #[arg(long)]
        watch: bool,
    },
    /// Record tag invalidations in the shared ledger.
    Invalidate {
        /// Tag to invalidate; may be given multiple times.
        #[arg(long = "tag", required = true)]
        tags: Vec<String>,
    },
    /// Report the shape of the on-disk cache tree.
    Stats,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
