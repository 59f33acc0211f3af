use thiserror::Error;
use tokio::io;

/// Rejected session operations. None of them leaves a partial effect behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("missing required parameter: {0}")]
    MissingParams(&'static str),

    #[error("a session is already running")]
    AlreadyRunning,

    #[error("no active session")]
    NoActiveSession,

    #[error("concurrency {requested} outside allowed range {min}..={max}")]
    InvalidRange {
        requested: usize,
        min: usize,
        max: usize,
    },
}

/// Failures of the worker launch capability.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {:?}", .0)]
    Spawn(#[from] io::Error),

    #[error("Spawned worker has no process id")]
    MissingPid,

    #[error("Unknown worker: {0}")]
    UnknownWorker(u32),
}

/// Why a worker stopped, as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEndCause {
    Finished,
    Crashed(Option<i32>),
    Killed,
}

impl WorkerEndCause {
    pub fn from_exit(code: Option<i32>, killed: bool) -> Self {
        // A clean exit wins over a kill that raced with it.
        match (code, killed) {
            (Some(0), _) => WorkerEndCause::Finished,
            (_, true) => WorkerEndCause::Killed,
            (code, false) => WorkerEndCause::Crashed(code),
        }
    }
}
