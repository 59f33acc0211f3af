use std::sync::Arc;

use async_channel::Receiver;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::download::session::SessionManager;
use crate::download::worker::WorkerEvent;

/// Feeds worker events into the session manager, one at a time.
pub struct Supervisor {
    manager: Arc<SessionManager>,
    receiver: Receiver<WorkerEvent>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(manager: Arc<SessionManager>, receiver: Receiver<WorkerEvent>) -> Self {
        Self {
            manager,
            receiver,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start supervisor
    pub async fn run(&self) {
        info!("Supervisor started");
        loop {
            let event = tokio::select! {
                event = self.receiver.recv() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            self.manager.handle_event(event);
        }
        debug!("Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::config::Config;
    use crate::download::progress::FileProgressStore;
    use crate::download::session::{SessionParams, SessionState};
    use crate::download::strategy::Strategy;
    use crate::download::worker::testing::FakeLauncher;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn should_apply_events_from_channel() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(Config {
            progress_dir: temp.path().join("progress"),
            state_file: None,
            ..Config::default()
        });
        let launcher = Arc::new(FakeLauncher::new());
        let store = Arc::new(FileProgressStore::new(config.progress_dir.clone()));
        let (manager, receiver) = SessionManager::new(config, launcher.clone(), store);

        let params = SessionParams::new("token", "https://share.example.com/s/x", temp.path()).unwrap();
        manager.start(params).unwrap();

        let (tx, rx) = async_channel::unbounded();
        drop(receiver);
        let supervisor = Supervisor::new(manager.clone(), rx);
        let shutdown = supervisor.shutdown_token();
        let handle = tokio::spawn(async move { supervisor.run().await });

        for (pid, _) in launcher.spawned.lock().clone() {
            tx.send(WorkerEvent::Exited { pid, code: Some(0), killed: false }).await.unwrap();
        }

        let mut state = None;
        for _ in 0..50 {
            state = manager.current().map(|s| s.state);
            if state == Some(SessionState::Terminated) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, Some(SessionState::Terminated));
        assert_eq!(launcher.spawned_with(Strategy::Random).len(), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
