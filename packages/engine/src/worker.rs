//! Workers: single-owner job queues over tokio tasks.
//!
//! Each worker owns a FIFO queue of submitted jobs and runs them in order;
//! mutations to a shared resource are serialized by routing every job that
//! touches it to the resource's owning worker. Workers never exchange state
//! except through their queues.
//!
//! Failures are muted: the first three consecutive job failures log in
//! full, then a single muting notice, and every power-of-ten total a
//! summary. The accounting worker watches for jobs that run suspiciously
//! long and warns without killing them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::{EngineError, Result};

/// The workers of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Single writer over monitors, data blocks, incoming blocks, stats.
    Command,
    /// Single writer over the variable environment and the outgoing map.
    Refresh,
    /// Pumps transport updates into the incoming map.
    Input,
    /// Paces refresh cycles and publishes outgoing blocks.
    Output,
    /// Tracks long-running jobs for diagnostics.
    Accounting,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerKind::Command => "command",
            WorkerKind::Refresh => "refresh",
            WorkerKind::Input => "input",
            WorkerKind::Output => "output",
            WorkerKind::Accounting => "accounting",
        };
        write!(f, "{}", s)
    }
}

tokio::task_local! {
    static CURRENT_WORKER: WorkerKind;
}

/// The worker the current task belongs to, if any. Used to run same-worker
/// submissions inline instead of deadlocking on the own queue.
pub fn current_worker() -> Option<WorkerKind> {
    CURRENT_WORKER.try_with(|k| *k).ok()
}

/// A job submitted to a worker queue.
pub type Job<S> = Box<dyn FnOnce(&S) -> Result<()> + Send + 'static>;

enum Envelope<S> {
    Job { label: &'static str, job: Job<S> },
    Stop,
}

/// Handle for submitting jobs to a worker.
pub struct WorkerHandle<S> {
    kind: WorkerKind,
    tx: mpsc::UnboundedSender<Envelope<S>>,
}

impl<S> Clone for WorkerHandle<S> {
    fn clone(&self) -> Self {
        WorkerHandle {
            kind: self.kind,
            tx: self.tx.clone(),
        }
    }
}

impl<S> WorkerHandle<S> {
    /// Enqueue a job. Fails when the worker's queue has been closed.
    pub fn submit(&self, label: &'static str, job: Job<S>) -> Result<()> {
        self.tx
            .send(Envelope::Job { label, job })
            .map_err(|_| EngineError::Closed {
                name: format!("{} worker", self.kind),
            })
    }

    /// Ask the worker to exit after draining already queued jobs.
    pub fn stop(&self) {
        let _ = self.tx.send(Envelope::Stop);
    }
}

/// Spawn a queue-consuming worker over shared state.
pub fn spawn_worker<S: Send + Sync + 'static>(
    kind: WorkerKind,
    state: Arc<S>,
    accounting: Option<mpsc::UnboundedSender<AccountingMsg>>,
) -> WorkerHandle<S> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<S>>();
    tokio::spawn(CURRENT_WORKER.scope(kind, async move {
        let mut meter = FailureMeter::new(format!("{} worker", kind));
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Stop => break,
                Envelope::Job { label, job } => {
                    if let Some(acc) = &accounting {
                        let _ = acc.send(AccountingMsg::Started {
                            worker: kind,
                            label,
                            at: Instant::now(),
                        });
                    }
                    let result = job(&state);
                    if let Some(acc) = &accounting {
                        let _ = acc.send(AccountingMsg::Finished { worker: kind });
                    }
                    meter.observe(&result);
                }
            }
        }
        log::debug!("{} worker exited", kind);
    }));
    WorkerHandle { kind, tx }
}

/// Run a closure with the current task marked as belonging to a worker.
/// Used by the pump loops, which are not queue consumers but still own
/// their resources.
pub async fn on_worker<F, T>(kind: WorkerKind, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_WORKER.scope(kind, fut).await
}

/// Consecutive-failure throttle for repeated error logging.
///
/// The first three consecutive failures log as errors (the third also
/// emits a single muting notice); later ones stay quiet except for a
/// summary at every power-of-ten total. Any success resets the streak.
pub struct FailureMeter {
    label: String,
    consecutive: u64,
    total: u64,
    muted: bool,
}

impl FailureMeter {
    pub fn new(label: impl Into<String>) -> FailureMeter {
        FailureMeter {
            label: label.into(),
            consecutive: 0,
            total: 0,
            muted: false,
        }
    }

    pub fn observe(&mut self, result: &Result<()>) {
        match result {
            Ok(()) => self.success(),
            Err(e) => self.failure(e),
        }
    }

    pub fn failure(&mut self, error: &dyn fmt::Display) {
        self.consecutive += 1;
        self.total += 1;
        if self.consecutive <= 3 {
            log::error!("{} failed: {}", self.label, error);
        }
        if self.consecutive == 3 {
            log::warn!("{}: muting further failures", self.label);
            self.muted = true;
        }
        if self.total > 3 && is_power_of_ten(self.total) {
            log::warn!("{}: {} failures so far", self.label, self.total);
        }
    }

    pub fn success(&mut self) {
        if self.muted {
            log::debug!("{}: recovered after {} consecutive failures", self.label, self.consecutive);
        }
        self.consecutive = 0;
        self.muted = false;
    }

    pub fn consecutive(&self) -> u64 {
        self.consecutive
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }
}

fn is_power_of_ten(n: u64) -> bool {
    let mut p = 1u64;
    while p < n {
        p = match p.checked_mul(10) {
            Some(next) => next,
            None => return false,
        };
    }
    p == n
}

/// Messages to the accounting worker.
pub enum AccountingMsg {
    Started {
        worker: WorkerKind,
        label: &'static str,
        at: Instant,
    },
    Finished {
        worker: WorkerKind,
    },
}

/// Spawn the accounting worker: warns (once per job) about submitted jobs
/// that exceed the long-duration threshold. Never kills anything.
pub fn spawn_accounting(mut rx: mpsc::UnboundedReceiver<AccountingMsg>, warn_after: Duration) {
    tokio::spawn(CURRENT_WORKER.scope(WorkerKind::Accounting, async move {
        let mut running: HashMap<WorkerKind, (&'static str, Instant, bool)> = HashMap::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    None => break,
                    Some(AccountingMsg::Started { worker, label, at }) => {
                        running.insert(worker, (label, at, false));
                    }
                    Some(AccountingMsg::Finished { worker }) => {
                        running.remove(&worker);
                    }
                },
                _ = ticker.tick() => {
                    for (worker, (label, at, warned)) in running.iter_mut() {
                        if !*warned && at.elapsed() >= warn_after {
                            log::warn!(
                                "{} worker job '{}' running for {:.1}s",
                                worker,
                                label,
                                at.elapsed().as_secs_f64()
                            );
                            *warned = true;
                        }
                    }
                }
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn meter_mutes_after_three_consecutive_failures() {
        let mut meter = FailureMeter::new("send updates");
        for _ in 0..2 {
            meter.failure(&"boom");
            assert!(!meter.is_muted());
        }
        meter.failure(&"boom");
        assert!(meter.is_muted());
        assert_eq!(meter.consecutive(), 3);
        assert_eq!(meter.total(), 3);

        // The next success resets the streak.
        meter.success();
        assert!(!meter.is_muted());
        assert_eq!(meter.consecutive(), 0);
        assert_eq!(meter.total(), 3);
    }

    #[test]
    fn meter_counts_totals_across_streaks() {
        let mut meter = FailureMeter::new("x");
        for _ in 0..5 {
            meter.failure(&"e");
            meter.success();
        }
        assert_eq!(meter.total(), 5);
    }

    #[test]
    fn power_of_ten_detection() {
        for n in [1, 10, 100, 1000, 10_000] {
            assert!(is_power_of_ten(n));
        }
        for n in [2, 11, 99, 101, 0] {
            assert!(!is_power_of_ten(n));
        }
    }

    #[tokio::test]
    async fn worker_runs_jobs_in_order() {
        let state = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_worker(WorkerKind::Command, state.clone(), None);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        for i in 0..3 {
            let _ = handle.submit(
                "test",
                Box::new(move |s: &Mutex<Vec<i32>>| {
                    s.lock().unwrap().push(i);
                    Ok(())
                }),
            );
        }
        let _ = handle.submit(
            "finish",
            Box::new(move |_s| {
                let _ = done_tx.send(());
                Ok(())
            }),
        );
        done_rx.await.unwrap();
        assert_eq!(state.lock().unwrap().as_slice(), [0, 1, 2]);
    }

    #[tokio::test]
    async fn worker_sees_its_own_kind() {
        let state = Arc::new(());
        let handle = spawn_worker(WorkerKind::Refresh, state, None);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = handle.submit(
            "probe",
            Box::new(move |_| {
                let _ = tx.send(current_worker());
                Ok(())
            }),
        );
        assert_eq!(rx.await.unwrap(), Some(WorkerKind::Refresh));
        assert_eq!(current_worker(), None);
    }

    #[tokio::test]
    async fn stopped_worker_rejects_submissions() {
        let state = Arc::new(());
        let handle = spawn_worker(WorkerKind::Command, state, None);
        handle.stop();
        // Give the worker a moment to drain and drop its receiver.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = handle.submit("late", Box::new(|_| Ok(())));
        assert!(matches!(result, Err(EngineError::Closed { .. })));
    }
}
