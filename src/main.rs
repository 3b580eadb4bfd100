mod app;
mod cli;
mod config;
mod db;
mod http;
mod paths;

use std::fs::{self, OpenOptions};

use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env, Target};

fn init_logger() {
    let mut builder = Builder::from_env(Env::new().filter_or("PLAYTRACK_LOG", "info"));
    // The playback loop owns the terminal, so log lines go to a file.
    let file = paths::log_file_path().ok().and_then(|path| {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok()?;
        }
        OpenOptions::new().create(true).append(true).open(path).ok()
    });
    match file {
        Some(file) => builder.target(Target::Pipe(Box::new(file))),
        None => builder.target(Target::Stderr),
    };
    let _ = builder.try_init();
}

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    init_logger();
    let config = config::Config::load()?;
    log::debug!("loaded config: player={}", config.player_bin.display());
    app::run(cli, config)
}
