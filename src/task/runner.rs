//!
//! # Terminal run mode
//! One session driven from the terminal until every worker is done. Ctrl-C
//! pauses instead of stopping, so the next run resumes.
//!

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::info;

use crate::download::session::{AggregateProgress, SessionManager, SessionParams, SessionState};
use crate::task::progress_bar::ProgressBar;

const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run_session(manager: Arc<SessionManager>, params: SessionParams) -> Result<AggregateProgress> {
    let id = manager.start(params)?;
    let mut bar = ProgressBar::new(100);
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                manager.pause()?;
                println!();
                info!("Session {} paused, run again to resume", id);
                break;
            }
        }

        let progress = manager.aggregate_progress(id).await;
        let speed = manager.throughput().instantaneous as u64;
        bar.print(progress.downloaded_files, progress.total_files, speed)?;

        if manager.current().map(|s| s.state) != Some(SessionState::Running) {
            println!();
            break;
        }
    }

    let progress = manager.aggregate_progress(id).await;
    info!(
        "{} of {} files present, {} error lines",
        progress.downloaded_files,
        progress.total_files,
        progress.error_text.lines().count()
    );
    Ok(progress)
}
