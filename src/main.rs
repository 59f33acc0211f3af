use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::error;

use folder_downloader::api::setup_server;
use folder_downloader::cli::{CliArgs, Command, RunArgs, WorkerArgs};
use folder_downloader::download::build_orchestrator;
use folder_downloader::download::config::Config;
use folder_downloader::download::logger::{setup_logger, setup_worker_logger};
use folder_downloader::download::session::SessionParams;
use folder_downloader::task::runner::run_session;
use folder_downloader::task::traversal::run_worker;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let result = match args.command {
        Command::Worker(worker) => worker_main(&args.config, worker).await,
        Command::Serve { bind } => serve_main(&args.config, bind).await,
        Command::Run(run) => run_main(&args.config, run).await,
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<Config> {
    let config = Config::load_or_default(path)?;
    setup_logger(&config.log_level, config.log_file.as_deref())?;
    Ok(config)
}

async fn serve_main(config_path: &std::path::Path, bind: Option<String>) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    let bind_addr = config.bind_addr.clone();

    let (manager, supervisor) = build_orchestrator(config)?;
    tokio::spawn(async move { supervisor.run().await });

    setup_server(manager.clone(), &bind_addr).await?;
    manager.stop();
    Ok(ExitCode::SUCCESS)
}

async fn run_main(config_path: &std::path::Path, run: RunArgs) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(concurrency) = run.concurrency {
        config.default_concurrency = concurrency;
    }

    let (manager, supervisor) = build_orchestrator(config)?;
    tokio::spawn(async move { supervisor.run().await });

    let params = SessionParams::new(run.token, run.link, run.dest)?;
    let progress = run_session(manager, params).await?;
    if progress.error_text.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

async fn worker_main(config_path: &std::path::Path, worker: WorkerArgs) -> Result<ExitCode> {
    let level = Config::load_or_default(config_path)
        .map(|config| config.log_level)
        .unwrap_or_else(|_| "info".to_string());
    setup_worker_logger(&level)?;

    match run_worker(&worker.token, &worker.link, &worker.dest, worker.strategy, &worker.progress_dir).await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!("Failed to traverse {}: {}", worker.link, err);
            Ok(ExitCode::FAILURE)
        }
    }
}
