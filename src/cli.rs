use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "playtrack",
    version,
    about = "Play episodes in mpv and track watch progress locally and on AniList"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Play one episode from a catalog file, offering the next one afterwards
    Play {
        catalog: PathBuf,
        /// Episode number; defaults to the first one in the catalog
        #[arg(short, long)]
        episode: Option<u32>,
        /// Audio preference such as `sub` or `dub`
        #[arg(short, long)]
        audio: Option<String>,
    },
    /// Pick up where local history or the tracker left off
    Continue { catalog: PathBuf },
    /// Show watch history, most recent first
    History,
    /// Show progress waiting to be synced to the tracker
    Queue,
    /// Push queued progress to the tracker now
    Sync,
}
