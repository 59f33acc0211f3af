//!
//! # Concurrency scaler
//! Reconciles the number of random-strategy workers against the session's
//! target. Forward and reverse workers are never touched here.
//!

use std::collections::BTreeMap;
use std::path::Path;

use log::{error, info, warn};

use crate::download::error::SessionError;
use crate::download::session::Session;
use crate::download::strategy::Strategy;
use crate::download::worker::{
    EventSender, WorkerHandle, WorkerId, WorkerLauncher, WorkerSpec, WorkerStatus,
};

pub const MIN_CONCURRENCY: usize = 2;

/// All-or-nothing bound check, done before any spawn or kill.
pub fn validate_target(target: usize, max: usize) -> Result<(), SessionError> {
    if (MIN_CONCURRENCY..=max).contains(&target) {
        Ok(())
    } else {
        Err(SessionError::InvalidRange {
            requested: target,
            min: MIN_CONCURRENCY,
            max,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScalePlan {
    pub spawn: usize,
    pub terminate: Vec<WorkerId>,
}

impl ScalePlan {
    pub fn is_noop(&self) -> bool {
        self.spawn == 0 && self.terminate.is_empty()
    }
}

/// Decide what to do without doing it. Workers already being killed do not
/// count, so a repeated request never kills twice.
pub fn plan(workers: &BTreeMap<WorkerId, WorkerHandle>, target: usize) -> ScalePlan {
    let mut random: Vec<&WorkerHandle> = workers
        .values()
        .filter(|w| w.strategy.is_scalable() && !w.is_terminating())
        .collect();
    let current = random.len();

    if target > current {
        return ScalePlan {
            spawn: target - current,
            terminate: Vec::new(),
        };
    }

    // Random workers are interchangeable; drop the newest first.
    random.sort_by(|a, b| b.spawn_seq.cmp(&a.spawn_seq));
    ScalePlan {
        spawn: 0,
        terminate: random
            .into_iter()
            .take(current - target)
            .map(|w| w.pid)
            .collect(),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScaleReport {
    pub spawned: Vec<WorkerId>,
    pub terminated: Vec<WorkerId>,
    pub failed: usize,
}

/// Borrowed view of what the scaler needs from the session manager.
pub struct ConcurrencyScaler<'a> {
    pub launcher: &'a dyn WorkerLauncher,
    pub events: &'a EventSender,
    pub progress_dir: &'a Path,
}

impl ConcurrencyScaler<'_> {
    /// Launch one worker and register it as `Starting`. Failures are recorded
    /// on the session and never abort the caller.
    pub fn spawn_worker(&self, session: &mut Session, strategy: Strategy) -> Option<WorkerId> {
        let spec = WorkerSpec {
            strategy,
            params: session.params.clone(),
            progress_dir: self.progress_dir.to_path_buf(),
        };

        match self.launcher.spawn(&spec, self.events.clone()) {
            Ok(pid) => {
                let seq = session.next_spawn_seq();
                session.workers.insert(pid, WorkerHandle::new(pid, strategy, seq));
                Some(pid)
            }
            Err(err) => {
                error!("Failed to spawn {} worker: {}", strategy, err);
                session.record_error(format!("failed to spawn {strategy} worker: {err}"));
                None
            }
        }
    }

    /// Bring the random workers to `session.target_concurrency`. Only issues
    /// spawns and kills; exits are confirmed later through worker events.
    pub fn reconcile(&self, session: &mut Session) -> ScaleReport {
        let plan = plan(&session.workers, session.target_concurrency);
        let mut report = ScaleReport::default();
        if plan.is_noop() {
            return report;
        }

        for _ in 0..plan.spawn {
            match self.spawn_worker(session, Strategy::Random) {
                Some(pid) => report.spawned.push(pid),
                None => report.failed += 1,
            }
        }

        for pid in plan.terminate {
            if let Err(err) = self.launcher.terminate(pid) {
                warn!("Failed to terminate worker pid={}: {}", pid, err);
            }
            if let Some(handle) = session.workers.get_mut(&pid) {
                handle.status = WorkerStatus::Terminating;
            }
            report.terminated.push(pid);
        }

        info!(
            "Session {} scaled to {} random workers (+{} -{}, {} failed)",
            session.id,
            session.target_concurrency,
            report.spawned.len(),
            report.terminated.len(),
            report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(spec: &[(WorkerId, Strategy)]) -> BTreeMap<WorkerId, WorkerHandle> {
        spec.iter()
            .enumerate()
            .map(|(seq, (pid, strategy))| (*pid, WorkerHandle::new(*pid, *strategy, seq as u64)))
            .collect()
    }

    #[test]
    fn should_validate_bounds() {
        assert!(validate_target(2, 100).is_ok());
        assert!(validate_target(100, 100).is_ok());
        assert_eq!(
            validate_target(1, 100),
            Err(SessionError::InvalidRange { requested: 1, min: 2, max: 100 })
        );
        assert!(validate_target(101, 100).is_err());
        assert!(validate_target(0, 100).is_err());
    }

    #[test]
    fn should_plan_spawns_for_random_class_only() {
        let set = workers(&[
            (1, Strategy::Forward),
            (2, Strategy::Reverse),
            (3, Strategy::Random),
            (4, Strategy::Random),
        ]);
        let plan = plan(&set, 10);
        assert_eq!(plan.spawn, 8);
        assert!(plan.terminate.is_empty());
    }

    #[test]
    fn should_terminate_newest_random_workers() {
        let set = workers(&[
            (10, Strategy::Forward),
            (11, Strategy::Reverse),
            (12, Strategy::Random),
            (13, Strategy::Random),
            (14, Strategy::Random),
            (15, Strategy::Random),
        ]);
        let plan = plan(&set, 2);
        assert_eq!(plan.spawn, 0);
        assert_eq!(plan.terminate, vec![15, 14]);
    }

    #[test]
    fn should_ignore_workers_already_terminating() {
        let mut set = workers(&[
            (1, Strategy::Random),
            (2, Strategy::Random),
            (3, Strategy::Random),
        ]);
        set.get_mut(&3).unwrap().status = WorkerStatus::Terminating;

        assert!(plan(&set, 2).is_noop());
        assert_eq!(plan(&set, 3).spawn, 1);
    }
}
