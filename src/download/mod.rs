use std::sync::Arc;

use anyhow::Result;

use crate::download::config::Config;
use crate::download::progress::FileProgressStore;
use crate::download::session::SessionManager;
use crate::download::supervisor::Supervisor;
use crate::download::worker::ProcessLauncher;

pub mod config;
pub mod error;
pub mod logger;
pub mod persistence;
pub mod progress;
pub mod scaler;
pub mod session;
pub mod strategy;
pub mod supervisor;
pub mod throughput;
pub mod util;
pub mod worker;

/// Wire the real process launcher and file progress store into a manager.
/// The returned supervisor must be run for worker events to be applied.
pub fn build_orchestrator(config: Config) -> Result<(Arc<SessionManager>, Supervisor)> {
    config.validate()?;

    let launcher = ProcessLauncher::new(config.worker_program()?)
        .with_leading_args(config.worker_args.iter().cloned());
    let progress = FileProgressStore::new(config.progress_dir.clone());

    let (manager, receiver) =
        SessionManager::new(Arc::new(config), Arc::new(launcher), Arc::new(progress));
    let supervisor = Supervisor::new(manager.clone(), receiver);

    Ok((manager, supervisor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::session::SessionParams;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[tokio::test]
    async fn should_be_run_with_real_processes() {
        let temp = TempDir::new().unwrap();
        // Stand-in worker: publish a finished record for itself, then exit.
        let script = r#"
            while [ "$#" -gt 0 ]; do
                case "$1" in
                    --strategy) strategy="$2"; shift ;;
                    --progress-dir) dir="$2"; shift ;;
                esac
                shift
            done
            mkdir -p "$dir"
            echo "3 3" > "$dir/progress_${strategy}_$$.txt"
            echo "walked $strategy"
        "#;
        let config = Config {
            progress_dir: temp.path().join("progress"),
            state_file: None,
            sample_interval_ms: 50,
            worker_program: Some("/bin/sh".into()),
            worker_args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            ..Config::default()
        };

        let (manager, supervisor) = build_orchestrator(config).unwrap();
        let mut output = manager.subscribe_output();
        tokio::spawn(async move { supervisor.run().await });

        let params =
            SessionParams::new("token", "https://share.example.com/s/x", temp.path().join("dest"))
                .unwrap();
        let id = manager.start(params).unwrap();

        let line = tokio::time::timeout(std::time::Duration::from_secs(10), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(line.line.starts_with("walked "));

        let mut progress = manager.aggregate_progress(id).await;
        for _ in 0..200 {
            if manager.current().map(|s| s.workers.is_empty()).unwrap_or(false) {
                progress = manager.aggregate_progress(id).await;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        assert_eq!(progress.total_files, 12);
        assert_eq!(progress.downloaded_files, 12);
    }
}
