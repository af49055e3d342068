//! The connection runtime.
//!
//! A connection binds a transport to a variable environment and drives the
//! block cycle across five workers: COMMAND (monitors, data blocks,
//! incoming, stats), REFRESH (environment and outgoing), the INPUT and
//! OUTPUT pumps, and ACCOUNTING. Single-writer discipline is enforced by
//! job routing: everything that mutates a resource is submitted to its
//! owning worker's queue, so the short locks below are uncontended by
//! construction and exist to let transports and tests take read snapshots.
//!
//! The update cycle is: drain incoming (COMMAND) → dispatch the batch and
//! refresh due monitors (REFRESH) → publish the drained outgoing map
//! (OUTPUT, without holding any lock while the transport blocks).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use lazy_static::lazy_static;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use crate::block::{Block, BlockMap};
use crate::env::VarEnv;
use crate::error::{EngineError, Result};
use crate::host::Roots;
use crate::monitor::{outgoing_blocks, MonitorTable};
use crate::router::{dispatch_batch, Evaluator, ReducerFn, RouterCtx};
use crate::transport::Transport;
use crate::worker::{
    current_worker, on_worker, spawn_accounting, spawn_worker, FailureMeter, WorkerHandle,
    WorkerKind,
};

/// Connection tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Refresh period for monitors that do not declare one, in seconds.
    pub default_update: f64,
    /// Emit `repr` hints alongside `{"ref"}` records.
    pub verbose_oids: bool,
    /// Print `READY` on the first successful outgoing publish.
    pub indicate_start: bool,
    /// Accounting warns about jobs running longer than this, in seconds.
    pub long_job_warning: f64,
    /// Terminate the process when a fire-and-forget job fails.
    pub exit_on_submit_failure: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            default_update: 0.1,
            verbose_oids: false,
            indicate_start: false,
            long_job_warning: 10.0,
            exit_on_submit_failure: false,
        }
    }
}

/// Counters kept by the connection.
#[derive(Default)]
struct Stats {
    blocks_in: AtomicU64,
    blocks_out: AtomicU64,
    refresh_passes: AtomicU64,
    publishes: AtomicU64,
}

/// Point-in-time view of the connection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub blocks_in: u64,
    pub blocks_out: u64,
    pub refresh_passes: u64,
    pub publishes: u64,
}

/// State partitioned across the COMMAND and REFRESH workers.
pub struct CoreState {
    /// REFRESH-owned.
    pub env: VarEnv,
    /// REFRESH-owned; drained by OUTPUT through the update cycle.
    pub outgoing: IndexMap<String, Block>,
    /// COMMAND-owned.
    pub monitors: MonitorTable,
    pub data_blocks: BTreeMap<String, Block>,
    pub reducers: BTreeMap<String, ReducerFn>,
    pub incoming: BlockMap,
}

struct Workers {
    command: WorkerHandle<Connection>,
    refresh: WorkerHandle<Connection>,
}

/// A running connection.
pub struct Connection {
    name: String,
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    evaluator: Option<Arc<dyn Evaluator>>,
    state: Mutex<CoreState>,
    workers: RwLock<Option<Workers>>,
    stats: Stats,
    epoch: Instant,
    shutdown: AtomicBool,
    ready_printed: AtomicBool,
}

impl Connection {
    /// Construct a connection around a transport, launch its workers, and
    /// call the transport's `init` hook. The first connection started
    /// becomes the process-wide default for [`current_connection`].
    pub async fn start(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        roots: Roots,
        evaluator: Option<Arc<dyn Evaluator>>,
        config: ConnectionConfig,
    ) -> Result<Arc<Connection>> {
        let name = name.into();
        let mut env = VarEnv::new(name.clone(), roots);
        env.oids.verbose = config.verbose_oids;

        let conn = Arc::new(Connection {
            name,
            config: config.clone(),
            transport: transport.clone(),
            evaluator,
            state: Mutex::new(CoreState {
                env,
                outgoing: IndexMap::new(),
                monitors: MonitorTable::new(),
                data_blocks: BTreeMap::new(),
                reducers: BTreeMap::new(),
                incoming: IndexMap::new(),
            }),
            workers: RwLock::new(None),
            stats: Stats::default(),
            epoch: Instant::now(),
            shutdown: AtomicBool::new(false),
            ready_printed: AtomicBool::new(false),
        });

        let (acc_tx, acc_rx) = mpsc::unbounded_channel();
        spawn_accounting(acc_rx, Duration::from_secs_f64(config.long_job_warning));
        let workers = Workers {
            command: spawn_worker(WorkerKind::Command, conn.clone(), Some(acc_tx.clone())),
            refresh: spawn_worker(WorkerKind::Refresh, conn.clone(), Some(acc_tx)),
        };
        *write_guard(&conn.workers) = Some(workers);

        transport.init(&conn).await?;

        tokio::spawn(on_worker(WorkerKind::Input, input_pump(conn.clone())));
        tokio::spawn(on_worker(WorkerKind::Output, output_pump(conn.clone())));

        let mut default = write_guard(&DEFAULT_CONNECTION);
        if default.is_none() {
            *default = Some(conn.clone());
        }
        drop(default);

        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Seconds since the connection started.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocks_in: self.stats.blocks_in.load(Ordering::Relaxed),
            blocks_out: self.stats.blocks_out.load(Ordering::Relaxed),
            refresh_passes: self.stats.refresh_passes.load(Ordering::Relaxed),
            publishes: self.stats.publishes.load(Ordering::Relaxed),
        }
    }

    /// Take a read snapshot of the connection state. For transports, tests,
    /// and diagnostics; mutations go through [`Connection::sync`] or
    /// [`Connection::submit`] on the owning worker.
    pub fn inspect<R>(&self, f: impl FnOnce(&CoreState) -> R) -> R {
        f(&lock_guard(&self.state))
    }

    fn worker(&self, kind: WorkerKind) -> Result<WorkerHandle<Connection>> {
        let guard = read_guard(&self.workers);
        let workers = guard.as_ref().ok_or_else(|| EngineError::Closed {
            name: self.name.clone(),
        })?;
        Ok(match kind {
            WorkerKind::Command => workers.command.clone(),
            WorkerKind::Refresh => workers.refresh.clone(),
            other => {
                return Err(EngineError::Closed {
                    name: format!("{}: no queue for {} worker", self.name, other),
                })
            }
        })
    }

    /// Submit a job to a worker and wait for its result. Runs inline when
    /// already on the target worker, so a job may call back into its own
    /// queue without deadlocking.
    pub async fn sync<R, F>(&self, kind: WorkerKind, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    {
        if current_worker() == Some(kind) {
            return f(self);
        }
        let (tx, rx) = oneshot::channel();
        self.worker(kind)?.submit(
            "sync",
            Box::new(move |conn| {
                let _ = tx.send(f(conn));
                Ok(())
            }),
        )?;
        rx.await.map_err(|_| EngineError::Closed {
            name: "worker dropped the job".to_string(),
        })?
    }

    /// Fire-and-forget submission. Failures are logged through the worker's
    /// failure meter; with `exit_on_submit_failure` they terminate the
    /// process.
    pub fn submit<F>(&self, kind: WorkerKind, label: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&Connection) -> Result<()> + Send + 'static,
    {
        let exit = self.config.exit_on_submit_failure;
        self.worker(kind)?.submit(
            label,
            Box::new(move |conn| {
                let result = f(conn);
                if exit {
                    if let Err(e) = &result {
                        log::error!("fatal submitted job failure: {}", e);
                        std::process::exit(70);
                    }
                }
                result
            }),
        )
    }

    /// Enqueue an outgoing `data` block by name; the last write before a
    /// refresh cycle wins. A no-op with a warning once shut down.
    pub fn send(&self, name: &str, value: JsonValue) {
        if self.is_shutdown() {
            log::warn!("send('{}') on shut-down connection '{}' discarded", name, self.name);
            return;
        }
        let block = Block::data(name, value);
        let key = name.to_string();
        let result = self.submit(WorkerKind::Refresh, "send", move |conn| {
            lock_guard(&conn.state).outgoing.insert(key, block);
            Ok(())
        });
        if result.is_err() {
            log::warn!("send('{}') on closed connection '{}' discarded", name, self.name);
        }
    }

    /// Cooperative shutdown: close the worker queues (each exits after
    /// draining) and stop the pumps. Every later submission fails with
    /// `Closed`; `send` becomes a warning no-op.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(workers) = write_guard(&self.workers).take() {
            workers.command.stop();
            workers.refresh.stop();
        }
        let mut default = write_guard(&DEFAULT_CONNECTION);
        if let Some(current) = default.as_ref() {
            if std::ptr::eq(Arc::as_ptr(current), self) {
                *default = None;
            }
        }
        drop(default);
        log::debug!("connection '{}' shut down", self.name);
    }

    /// One update cycle on REFRESH: dispatch the inbound batch, refresh due
    /// monitors, and drain the outgoing map.
    fn update_cycle(&self, batch: BlockMap, now: f64) -> IndexMap<String, Block> {
        let mut guard = lock_guard(&self.state);
        let state = &mut *guard;
        if !batch.is_empty() {
            let mut ctx = RouterCtx {
                env: &mut state.env,
                monitors: &mut state.monitors,
                data_blocks: &mut state.data_blocks,
                reducers: &mut state.reducers,
                evaluator: self.evaluator.as_deref(),
                subscriber: &self.name,
                default_update: self.config.default_update,
                outgoing: &mut state.outgoing,
            };
            dispatch_batch(&mut ctx, batch);
        }

        let fresh = outgoing_blocks(
            &mut state.env,
            &mut state.monitors,
            now,
            false,
            self.config.default_update,
        );
        for (name, block) in fresh {
            state.outgoing.insert(name, block);
        }
        self.stats.refresh_passes.fetch_add(1, Ordering::Relaxed);

        let out = std::mem::take(&mut state.outgoing);
        self.stats
            .blocks_out
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        out
    }

    /// Output pump pace: a tenth of the shortest period in play.
    fn output_pause(&self) -> f64 {
        let period = match self.transport.outgoing_update_period() {
            Some(p) => p,
            None => {
                let min_monitor = self.inspect(|state| {
                    state
                        .monitors
                        .values()
                        .filter(|m| m.update > 0.0)
                        .map(|m| m.update)
                        .fold(f64::INFINITY, f64::min)
                });
                min_monitor.min(self.config.default_update)
            }
        };
        (period / 10.0).max(0.001)
    }

    fn note_published(&self) {
        self.stats.publishes.fetch_add(1, Ordering::Relaxed);
        if self.config.indicate_start && !self.ready_printed.swap(true, Ordering::SeqCst) {
            println!("READY");
            log::info!("connection '{}' ready", self.name);
        }
    }
}

async fn input_pump(conn: Arc<Connection>) {
    let mut meter = FailureMeter::new(format!("{}: get updates", conn.name));
    while !conn.is_shutdown() {
        let wait = conn.transport.incoming_update_period();
        match conn.transport.get_updates(wait).await {
            Ok(Some(blocks)) if !blocks.is_empty() => {
                meter.success();
                let count = blocks.len() as u64;
                let queued = conn.submit(WorkerKind::Command, "ingest", move |c| {
                    let mut state = lock_guard(&c.state);
                    for (name, block) in blocks {
                        state.incoming.insert(name, block);
                    }
                    Ok(())
                });
                if queued.is_err() {
                    break;
                }
                conn.stats.blocks_in.fetch_add(count, Ordering::Relaxed);
            }
            Ok(_) => meter.success(),
            Err(e) => {
                meter.failure(&e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    log::debug!("{}: input pump exited", conn.name);
}

async fn output_pump(conn: Arc<Connection>) {
    let mut meter = FailureMeter::new(format!("{}: send updates", conn.name));
    while !conn.is_shutdown() {
        let batch = match conn
            .sync(WorkerKind::Command, |c| {
                Ok(std::mem::take(&mut lock_guard(&c.state).incoming))
            })
            .await
        {
            Ok(batch) => batch,
            Err(_) => break,
        };

        let now = conn.now();
        let out = match conn
            .sync(WorkerKind::Refresh, move |c| Ok(c.update_cycle(batch, now)))
            .await
        {
            Ok(out) => out,
            Err(_) => break,
        };

        if conn.transport.has_updates(&out) {
            match conn.transport.send_updates(out).await {
                Ok(()) => {
                    meter.success();
                    conn.note_published();
                }
                Err(e) => meter.failure(&e),
            }
        }

        tokio::time::sleep(Duration::from_secs_f64(conn.output_pause())).await;
    }
    log::debug!("{}: output pump exited", conn.name);
}

fn lock_guard<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

lazy_static! {
    static ref DEFAULT_CONNECTION: RwLock<Option<Arc<Connection>>> = RwLock::new(None);
}

tokio::task_local! {
    static CURRENT_CONNECTION: Arc<Connection>;
}

/// The ambient connection: the task-scoped one when inside
/// [`with_connection`], otherwise the process-wide default (the first
/// connection started).
pub fn current_connection() -> Option<Arc<Connection>> {
    if let Ok(conn) = CURRENT_CONNECTION.try_with(Clone::clone) {
        return Some(conn);
    }
    read_guard(&DEFAULT_CONNECTION).clone()
}

/// Run a future with the given connection as the task-scoped ambient one.
pub async fn with_connection<F, T>(conn: Arc<Connection>, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_CONNECTION.scope(conn, fut).await
}
