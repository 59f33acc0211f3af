use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::download::strategy::Strategy;
use crate::download::worker::TOKEN_ENV;

#[derive(Parser, Debug)]
#[command(author, version, about = "Parallel downloader for shared remote folders")]
pub struct CliArgs {
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API
    Serve {
        /// Overrides `bind_addr` from the config file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Download one shared folder with a terminal progress bar
    Run(RunArgs),
    /// Traverse a shared folder as a single worker process
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long)]
    pub link: String,
    #[arg(long)]
    pub dest: PathBuf,
    /// Random workers to start with
    #[arg(long)]
    pub concurrency: Option<usize>,
    #[arg(long, env = TOKEN_ENV, hide_env_values = true)]
    pub token: String,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub link: String,
    #[arg(long)]
    pub dest: PathBuf,
    #[arg(long)]
    pub strategy: Strategy,
    #[arg(long)]
    pub progress_dir: PathBuf,
    /// Only read from the environment so it never shows up in process lists
    #[arg(skip = std::env::var(TOKEN_ENV).unwrap_or_default())]
    pub token: String,
}
