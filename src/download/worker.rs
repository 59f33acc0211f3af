//!
//! # Worker processes
//! Handles for spawned workers and the launch capability the session manager
//! depends on. Spawning and termination are fire-and-forget; everything the
//! manager learns afterwards arrives as a [`WorkerEvent`].
//!

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::download::error::WorkerError;
use crate::download::progress::{Counters, WorkerKey};
use crate::download::session::SessionParams;
use crate::download::strategy::Strategy;

/// Environment variable carrying the access credential into a worker.
pub const TOKEN_ENV: &str = "FOLDER_DL_TOKEN";

pub type WorkerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Alive,
    /// Kill issued, exit not yet confirmed.
    Terminating,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHandle {
    pub pid: WorkerId,
    pub strategy: Strategy,
    pub status: WorkerStatus,
    pub last_known: Counters,
    #[serde(skip)]
    pub spawn_seq: u64,
}

impl WorkerHandle {
    pub fn new(pid: WorkerId, strategy: Strategy, spawn_seq: u64) -> Self {
        Self {
            pid,
            strategy,
            status: WorkerStatus::Starting,
            last_known: Counters::default(),
            spawn_seq,
        }
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(self.strategy, self.pid)
    }

    pub fn is_terminating(&self) -> bool {
        self.status == WorkerStatus::Terminating
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line a worker printed, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub pid: WorkerId,
    pub strategy: Strategy,
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started {
        pid: WorkerId,
    },
    Output(OutputLine),
    Exited {
        pid: WorkerId,
        code: Option<i32>,
        killed: bool,
    },
}

pub type EventSender = async_channel::Sender<WorkerEvent>;
pub type EventReceiver = async_channel::Receiver<WorkerEvent>;

/// Everything a worker is told at launch.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub strategy: Strategy,
    pub params: SessionParams,
    pub progress_dir: PathBuf,
}

pub trait WorkerLauncher: Send + Sync {
    /// Launch a worker. Its start, output and exit are reported on `events`.
    fn spawn(&self, spec: &WorkerSpec, events: EventSender) -> Result<WorkerId, WorkerError>;

    /// Issue a forceful termination. Does not wait for the exit.
    fn terminate(&self, pid: WorkerId) -> Result<(), WorkerError>;
}

/// Launches workers as child processes of `program`, which must understand
/// the `worker` subcommand.
pub struct ProcessLauncher {
    program: PathBuf,
    leading_args: Vec<OsString>,
    kill_switches: Arc<Mutex<HashMap<WorkerId, CancellationToken>>>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            kill_switches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arguments placed before the `worker` subcommand, e.g. a wrapper's flags.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn live_count(&self) -> usize {
        self.kill_switches.lock().len()
    }

    pub fn worker_args(&self, spec: &WorkerSpec) -> Vec<OsString> {
        let mut args = self.leading_args.clone();
        args.push("worker".into());
        args.push("--link".into());
        args.push(spec.params.shared_link.clone().into());
        args.push("--dest".into());
        args.push(spec.params.destination.clone().into_os_string());
        args.push("--strategy".into());
        args.push(spec.strategy.as_str().into());
        args.push("--progress-dir".into());
        args.push(spec.progress_dir.clone().into_os_string());
        args
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(&self, spec: &WorkerSpec, events: EventSender) -> Result<WorkerId, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(self.worker_args(spec))
            .env(TOKEN_ENV, &spec.params.credential)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            return Err(WorkerError::MissingPid);
        };

        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, pid, spec.strategy, OutputStream::Stdout, events.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, pid, spec.strategy, OutputStream::Stderr, events.clone());
        }

        let token = CancellationToken::new();
        self.kill_switches.lock().insert(pid, token.clone());
        tokio::spawn(supervise(child, pid, token, events, self.kill_switches.clone()));

        info!("Spawned {} worker pid={}", spec.strategy, pid);
        Ok(pid)
    }

    fn terminate(&self, pid: WorkerId) -> Result<(), WorkerError> {
        match self.kill_switches.lock().get(&pid) {
            Some(token) => {
                token.cancel();
                debug!("Kill issued for worker pid={}", pid);
                Ok(())
            }
            None => Err(WorkerError::UnknownWorker(pid)),
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: WorkerId,
    token: CancellationToken,
    events: EventSender,
    kill_switches: Arc<Mutex<HashMap<WorkerId, CancellationToken>>>,
) {
    let _ = events.send(WorkerEvent::Started { pid }).await;

    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            killed = true;
            if let Err(err) = child.start_kill() {
                warn!("Failed to kill worker pid={}: {}", pid, err);
            }
            child.wait().await
        }
    };

    kill_switches.lock().remove(&pid);
    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!("Failed to await worker pid={}: {}", pid, err);
            None
        }
    };

    let _ = events.send(WorkerEvent::Exited { pid, code, killed }).await;
}

fn pump_lines<R>(
    reader: R,
    pid: WorkerId,
    strategy: Strategy,
    stream: OutputStream,
    events: EventSender,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = WorkerEvent::Output(OutputLine { pid, strategy, stream, line });
            if events.send(event).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    /// Records launches and kills instead of touching processes. Exits are
    /// injected by the test through the session manager.
    pub struct FakeLauncher {
        next_pid: AtomicU32,
        fail_spawns: AtomicBool,
        pub spawned: Mutex<Vec<(WorkerId, Strategy)>>,
        pub terminated: Mutex<Vec<WorkerId>>,
    }

    impl FakeLauncher {
        pub const FIRST_PID: WorkerId = 1000;

        pub fn new() -> Self {
            Self {
                next_pid: AtomicU32::new(Self::FIRST_PID),
                fail_spawns: AtomicBool::new(false),
                spawned: Mutex::new(Vec::new()),
                terminated: Mutex::new(Vec::new()),
            }
        }

        /// Hand out previously used pids again, like an OS would.
        pub fn reuse_pids(&self) {
            self.next_pid.store(Self::FIRST_PID, Ordering::SeqCst);
        }

        pub fn fail_spawns(&self, fail: bool) {
            self.fail_spawns.store(fail, Ordering::SeqCst);
        }

        pub fn spawned_with(&self, strategy: Strategy) -> Vec<WorkerId> {
            self.spawned
                .lock()
                .iter()
                .filter(|(_, s)| *s == strategy)
                .map(|(pid, _)| *pid)
                .collect()
        }

        pub fn spawn_count(&self) -> usize {
            self.spawned.lock().len()
        }

        pub fn terminated(&self) -> Vec<WorkerId> {
            self.terminated.lock().clone()
        }
    }

    impl WorkerLauncher for FakeLauncher {
        fn spawn(&self, spec: &WorkerSpec, _events: EventSender) -> Result<WorkerId, WorkerError> {
            if self.fail_spawns.load(Ordering::SeqCst) {
                return Err(WorkerError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such program",
                )));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.spawned.lock().push((pid, spec.strategy));
            Ok(pid)
        }

        fn terminate(&self, pid: WorkerId) -> Result<(), WorkerError> {
            self.terminated.lock().push(pid);
            Ok(())
        }
    }
}
