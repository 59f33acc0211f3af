//!
//! # Session manager
//! Single authority over session state and the live worker set. At most one
//! session is Running or Paused at any time.
//!

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::Stream;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::download::config::Config;
use crate::download::error::{SessionError, WorkerEndCause};
use crate::download::persistence::{PausedSession, PersistenceState};
use crate::download::progress::{Counters, ProgressStore, WorkerKey};
use crate::download::scaler::{validate_target, ConcurrencyScaler};
use crate::download::strategy::default_mix;
use crate::download::throughput::{ThroughputSnapshot, TransferRateMonitor};
use crate::download::util::{scan_dir, DirStats};
use crate::download::worker::{
    EventReceiver, EventSender, OutputLine, OutputStream, WorkerEvent, WorkerHandle, WorkerId,
    WorkerLauncher, WorkerStatus,
};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const MAX_ERROR_LINES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    #[serde(skip)]
    pub credential: String,
    pub shared_link: String,
    pub destination: PathBuf,
}

impl SessionParams {
    pub fn new(
        credential: impl Into<String>,
        shared_link: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Result<Self, SessionError> {
        let params = Self {
            credential: credential.into().trim().to_string(),
            shared_link: shared_link.into().trim().to_string(),
            destination: destination.into(),
        };

        if params.credential.is_empty() {
            return Err(SessionError::MissingParams("credential"));
        }
        if params.shared_link.is_empty() {
            return Err(SessionError::MissingParams("sharedLink"));
        }
        if params.destination.as_os_str().is_empty() {
            return Err(SessionError::MissingParams("destinationPath"));
        }
        Ok(params)
    }

    /// Whether a paused session with `self` can be resumed by `other`. A
    /// session restored from disk has no credential and accepts any.
    fn resumes_with(&self, other: &SessionParams) -> bool {
        self.shared_link == other.shared_link
            && self.destination == other.destination
            && (self.credential.is_empty() || self.credential == other.credential)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateProgress {
    pub total_files: u64,
    pub downloaded_files: u64,
    pub error_text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub shared_link: String,
    pub destination: PathBuf,
    pub target_concurrency: usize,
    pub workers: Vec<WorkerHandle>,
}

#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    pub params: SessionParams,
    pub target_concurrency: usize,
    pub workers: BTreeMap<WorkerId, WorkerHandle>,
    /// Final counters of workers that completed their traversal.
    finished: Counters,
    errors: VecDeque<String>,
    spawn_seq: u64,
}

impl Session {
    pub fn new(id: Uuid, params: SessionParams, target_concurrency: usize) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            params,
            target_concurrency,
            workers: BTreeMap::new(),
            finished: Counters::default(),
            errors: VecDeque::new(),
            spawn_seq: 0,
        }
    }

    pub(crate) fn next_spawn_seq(&mut self) -> u64 {
        self.spawn_seq += 1;
        self.spawn_seq
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        if self.errors.len() == MAX_ERROR_LINES {
            self.errors.pop_front();
        }
        self.errors.push_back(message.into());
    }

    /// Forget counters and errors of a previous run.
    fn reset_run(&mut self) {
        self.workers.clear();
        self.finished = Counters::default();
        self.errors.clear();
    }

    fn record_keys(&self) -> Vec<WorkerKey> {
        self.workers.values().map(WorkerHandle::key).collect()
    }

    /// Merge fresh reads into the live handles. Reads for workers that exited
    /// in the meantime are dropped; their exit already settled the counters.
    fn apply_reads(&mut self, reads: Vec<(WorkerKey, Counters)>) {
        for (key, counters) in reads {
            if let Some(worker) = self.workers.get_mut(&key.pid) {
                if worker.key() == key {
                    worker.last_known = worker.last_known.merge_max(counters);
                }
            }
        }
    }

    /// Keep the counters of a worker that is gone for good.
    fn retire(&mut self, worker: &WorkerHandle, last_read: Option<Counters>) -> Counters {
        let counters = match last_read {
            Some(counters) => worker.last_known.merge_max(counters),
            None => worker.last_known,
        };
        self.finished = self.finished + counters;
        counters
    }

    fn aggregate(&self) -> AggregateProgress {
        let live: Counters = self.workers.values().map(|w| w.last_known).sum();
        let total = self.finished + live;
        AggregateProgress {
            total_files: total.total,
            downloaded_files: total.downloaded,
            error_text: self.errors.iter().cloned().collect::<Vec<_>>().join("\n"),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            state: self.state,
            shared_link: self.params.shared_link.clone(),
            destination: self.params.destination.clone(),
            target_concurrency: self.target_concurrency,
            workers: self.workers.values().cloned().collect(),
        }
    }
}

pub struct SessionManager {
    config: Arc<Config>,
    launcher: Arc<dyn WorkerLauncher>,
    progress: Arc<dyn ProgressStore>,
    monitor: TransferRateMonitor,
    // One lock for all sessions: it also serializes scale operations.
    sessions: Mutex<HashMap<Uuid, Session>>,
    events: EventSender,
    output: broadcast::Sender<OutputLine>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        launcher: Arc<dyn WorkerLauncher>,
        progress: Arc<dyn ProgressStore>,
    ) -> (Arc<Self>, EventReceiver) {
        let (events, receiver) = async_channel::unbounded();
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let monitor = TransferRateMonitor::new(config.sample_interval(), config.throughput_window);

        let mut sessions = HashMap::new();
        if let Some(paused) = Self::load_paused(&config) {
            info!("Restored paused session {} for {:?}", paused.id, paused.destination);
            let params = SessionParams {
                credential: String::new(),
                shared_link: paused.shared_link,
                destination: paused.destination,
            };
            let mut session = Session::new(paused.id, params, paused.target_concurrency);
            session.state = SessionState::Paused;
            sessions.insert(session.id, session);
        }

        let manager = Arc::new(Self {
            config,
            launcher,
            progress,
            monitor,
            sessions: Mutex::new(sessions),
            events,
            output,
        });

        (manager, receiver)
    }

    fn scaler(&self) -> ConcurrencyScaler<'_> {
        ConcurrencyScaler {
            launcher: self.launcher.as_ref(),
            events: &self.events,
            progress_dir: &self.config.progress_dir,
        }
    }

    /// Start a new session, or resume the paused one when `params` match it.
    pub fn start(&self, params: SessionParams) -> Result<Uuid, SessionError> {
        let mut sessions = self.sessions.lock();
        if sessions.values().any(|s| s.state == SessionState::Running) {
            return Err(SessionError::AlreadyRunning);
        }

        let resumed = sessions
            .values()
            .find(|s| s.state == SessionState::Paused && s.params.resumes_with(&params))
            .map(|s| s.id);
        let id = resumed.unwrap_or_else(Uuid::new_v4);
        // Only one session is kept around; anything else is done with.
        sessions.retain(|key, _| *key == id);

        // Must happen before the first spawn of the new run.
        match self.progress.clear() {
            Ok(removed) if removed > 0 => debug!("Removed {} stale progress records", removed),
            Ok(_) => {}
            Err(err) => warn!("Failed to clear progress records: {}", err),
        }

        let default_target = self.config.default_concurrency;
        let session = sessions
            .entry(id)
            .or_insert_with(|| Session::new(id, params.clone(), default_target));
        session.params = params;
        session.reset_run();
        session.state = SessionState::Running;

        match resumed {
            Some(_) => info!("Resuming session {} into {:?}", id, session.params.destination),
            None => info!("Starting session {} into {:?}", id, session.params.destination),
        }

        let scaler = self.scaler();
        for strategy in default_mix(session.target_concurrency) {
            scaler.spawn_worker(session, strategy);
        }

        self.monitor.start(session.params.destination.clone());
        self.clear_persisted();

        if session.workers.is_empty() {
            error!("Session {} has no workers to run", id);
            session.state = SessionState::Terminated;
            self.monitor.stop();
        }

        Ok(id)
    }

    /// Kill every worker of the running session and keep it for a resume.
    pub fn pause(&self) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .values_mut()
            .find(|s| s.state == SessionState::Running)
            .ok_or(SessionError::NoActiveSession)?;

        self.terminate_all(session);
        session.state = SessionState::Paused;
        self.monitor.stop();
        info!("Paused session {}", session.id);

        self.persist_paused(session);
        Ok(())
    }

    /// Tear down every session. Always succeeds.
    pub fn stop(&self) {
        let mut sessions = self.sessions.lock();
        for session in sessions.values_mut() {
            self.terminate_all(session);
            session.state = SessionState::Terminated;
            info!("Terminated session {}", session.id);
        }
        sessions.clear();

        if let Err(err) = self.progress.clear() {
            warn!("Failed to clear progress records: {}", err);
        }
        self.monitor.stop();
        self.clear_persisted();
    }

    fn terminate_all(&self, session: &mut Session) {
        // Issuing the kills is the ordering boundary, not the exits.
        for pid in session.workers.keys() {
            if let Err(err) = self.launcher.terminate(*pid) {
                warn!("Failed to terminate worker pid={}: {}", pid, err);
            }
        }
        session.workers.clear();
    }

    pub fn set_target_concurrency(&self, target: usize) -> Result<(), SessionError> {
        validate_target(target, self.config.max_concurrency)?;

        let mut sessions = self.sessions.lock();
        let session = sessions
            .values_mut()
            .find(|s| s.state == SessionState::Running)
            .ok_or(SessionError::NoActiveSession)?;

        session.target_concurrency = target;
        self.scaler().reconcile(session);
        Ok(())
    }

    /// Sum of the session's counters after a best-effort refresh. Unknown
    /// sessions report zeros.
    pub async fn aggregate_progress(&self, id: Uuid) -> AggregateProgress {
        let keys = {
            let sessions = self.sessions.lock();
            match sessions.get(&id) {
                Some(session) => session.record_keys(),
                None => return AggregateProgress::default(),
            }
        };

        // Records are files: read them on the blocking pool, without the lock.
        let store = self.progress.clone();
        let reads = tokio::task::spawn_blocking(move || {
            keys.into_iter()
                .filter_map(|key| store.read(&key).map(|counters| (key, counters)))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_else(|err| {
            warn!("Progress refresh for session {} failed: {}", id, err);
            Vec::new()
        });

        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&id) {
            Some(session) => {
                session.apply_reads(reads);
                session.aggregate()
            }
            None => AggregateProgress::default(),
        }
    }

    /// The running session, else the paused one, else whatever is left.
    pub fn current(&self) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock();
        let rank = |s: &Session| match s.state {
            SessionState::Running => 0,
            SessionState::Paused => 1,
            SessionState::Idle => 2,
            SessionState::Terminated => 3,
        };
        sessions.values().min_by_key(|s| rank(s)).map(Session::snapshot)
    }

    pub fn throughput(&self) -> ThroughputSnapshot {
        self.monitor.snapshot()
    }

    pub async fn destination_stats(&self) -> DirStats {
        match self.current() {
            Some(session) => scan_dir(session.destination).await,
            None => DirStats::default(),
        }
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output.subscribe()
    }

    /// Worker output as a stream. Lines missed by a slow consumer are skipped.
    pub fn output_stream(&self) -> impl Stream<Item = OutputLine> + 'static {
        let mut receiver = self.subscribe_output();

        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(line) => yield line,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Output consumer lagged, {} lines dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pub fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { pid } => {
                let mut sessions = self.sessions.lock();
                if let Some(worker) = sessions.values_mut().find_map(|s| s.workers.get_mut(&pid)) {
                    if worker.status == WorkerStatus::Starting {
                        worker.status = WorkerStatus::Alive;
                    }
                }
            }
            WorkerEvent::Output(line) => {
                if line.stream == OutputStream::Stderr {
                    let mut sessions = self.sessions.lock();
                    if let Some(session) =
                        sessions.values_mut().find(|s| s.workers.contains_key(&line.pid))
                    {
                        session.record_error(format!("[{} {}] {}", line.strategy, line.pid, line.line));
                    }
                }
                // Nobody listening is fine.
                let _ = self.output.send(line);
            }
            WorkerEvent::Exited { pid, code, killed } => self.reap(pid, code, killed),
        }
    }

    fn reap(&self, pid: WorkerId, code: Option<i32>, killed: bool) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.values_mut().find(|s| s.workers.contains_key(&pid)) else {
            debug!("Exit of untracked worker pid={} code={:?}", pid, code);
            return;
        };
        let Some(worker) = session.workers.remove(&pid) else {
            return;
        };

        let cause = WorkerEndCause::from_exit(code, killed || worker.is_terminating());
        match cause {
            WorkerEndCause::Finished => {
                let counters = session.retire(&worker, self.progress.read(&worker.key()));
                info!(
                    "{} worker pid={} finished ({}/{} files)",
                    worker.strategy, pid, counters.downloaded, counters.total
                );
            }
            WorkerEndCause::Crashed(code) => {
                warn!(
                    "{} worker pid={} exited unexpectedly with code {:?}",
                    worker.strategy, pid, code
                );
            }
            // Scale-down kills: what the worker fetched stays on disk and counted.
            WorkerEndCause::Killed => {
                let counters = session.retire(&worker, self.progress.read(&worker.key()));
                debug!(
                    "{} worker pid={} killed ({}/{} files)",
                    worker.strategy, pid, counters.downloaded, counters.total
                );
            }
        }

        if session.state == SessionState::Running && session.workers.is_empty() {
            info!("All workers of session {} are done", session.id);
            session.state = SessionState::Terminated;
            self.monitor.stop();
        }
    }

    fn load_paused(config: &Config) -> Option<PausedSession> {
        let path = config.state_file.as_ref()?;
        match PersistenceState::load_from_file(path) {
            Ok(state) => state.paused,
            Err(err) => {
                warn!("Ignoring unreadable session state {:?}: {}", path, err);
                None
            }
        }
    }

    fn persist_paused(&self, session: &Session) {
        let Some(path) = self.config.state_file.as_ref() else {
            return;
        };
        let state = PersistenceState {
            paused: Some(PausedSession {
                id: session.id,
                shared_link: session.params.shared_link.clone(),
                destination: session.params.destination.clone(),
                target_concurrency: session.target_concurrency,
            }),
        };
        if let Err(err) = state.save_to_file(path) {
            warn!("Failed to save paused session to {:?}: {}", path, err);
        }
    }

    fn clear_persisted(&self) {
        if let Some(path) = self.config.state_file.as_ref() {
            if let Err(err) = PersistenceState::clear_file(path) {
                warn!("Failed to remove session state {:?}: {}", path, err);
            }
        }
    }
}
