//! Durable task queue: typed handler registry, single-task claim/execute, and
//! a polling worker thread.
//!
//! A claim is one short write that leases the task to the claiming worker.
//! The handler runs outside any transaction, so producers can keep adding
//! tasks while a long job talks to the SCM. Handlers own the atomicity of
//! their own writes. A worker that dies mid-task leaves its lease behind;
//! once the lease runs out the task is claimable again.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::error::{RelayError, Result};
use crate::model::{Task, TaskStatus};

trait TaskHandler: Send {
    fn payload_type(&self) -> TypeId;

    /// Check that `data` decodes into the handler's payload type.
    fn validate(&self, data: &[u8]) -> Result<()>;

    fn run(&self, conn: &Connection, data: &[u8]) -> anyhow::Result<()>;
}

struct TypedHandler<P, F> {
    func: F,
    payload: PhantomData<fn() -> P>,
}

impl<P, F> TaskHandler for TypedHandler<P, F>
where
    P: DeserializeOwned + 'static,
    F: Fn(&Connection, P) -> anyhow::Result<()> + Send,
{
    fn payload_type(&self) -> TypeId {
        TypeId::of::<P>()
    }

    fn validate(&self, data: &[u8]) -> Result<()> {
        serde_json::from_slice::<P>(data)?;
        Ok(())
    }

    fn run(&self, conn: &Connection, data: &[u8]) -> anyhow::Result<()> {
        let payload: P = serde_json::from_slice(data)?;
        (self.func)(conn, payload)
    }
}

/// What a single `run_once` step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing claimable (empty queue, every task leased, or the store busy).
    Idle,
    Completed(i64),
    Failed(i64),
}

/// How long a claimed task stays reserved for its worker.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(15 * 60);

/// Job types by name, each with a typed payload and handler.
pub struct TaskRegistry {
    handlers: HashMap<String, Box<dyn TaskHandler>>,
    lease: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            lease: DEFAULT_LEASE,
        }
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease claimed tasks for `lease`. A job that outlives its lease may be
    /// claimed and run again by another worker.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Register `func` to run tasks named `name`, whose JSON payload decodes
    /// into `P`. Registering a name again replaces its handler.
    pub fn register<P, F>(&mut self, name: &str, func: F)
    where
        P: Serialize + DeserializeOwned + 'static,
        F: Fn(&Connection, P) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers.insert(
            name.to_string(),
            Box::new(TypedHandler {
                func,
                payload: PhantomData,
            }),
        );
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn handler(&self, name: &str) -> Result<&dyn TaskHandler> {
        self.handlers
            .get(name)
            .map(|h| h.as_ref())
            .ok_or_else(|| RelayError::InvalidTask(format!("no task registered as '{name}'")))
    }

    /// Schedule a typed payload. Fails unless `name` is registered for
    /// exactly this payload type.
    pub fn enqueue<P>(&self, conn: &Connection, name: &str, payload: &P) -> Result<i64>
    where
        P: Serialize + 'static,
    {
        let handler = self.handler(name)?;
        if handler.payload_type() != TypeId::of::<P>() {
            return Err(RelayError::InvalidTask(format!(
                "task '{name}' does not accept a {} payload",
                std::any::type_name::<P>()
            )));
        }
        let data = serde_json::to_vec(payload)?;
        handler
            .validate(&data)
            .map_err(|e| RelayError::InvalidTask(format!("invalid payload for '{name}': {e}")))?;
        self.insert(conn, name, &data)
    }

    /// Schedule an already-serialized JSON payload, checking that it decodes.
    pub fn enqueue_raw(&self, conn: &Connection, name: &str, data: &[u8]) -> Result<i64> {
        self.handler(name)?
            .validate(data)
            .map_err(|e| RelayError::InvalidTask(format!("invalid payload for '{name}': {e}")))?;
        self.insert(conn, name, data)
    }

    fn insert(&self, conn: &Connection, name: &str, data: &[u8]) -> Result<i64> {
        let id = db::add_task(conn, name, data)?;
        debug!(task_id = id, name, "task scheduled");
        Ok(id)
    }

    /// Claim the oldest schedulable task, run it, and record the result.
    ///
    /// Errors are infrastructure failures only; a failing handler is
    /// reported as `RunOutcome::Failed`.
    pub fn run_once(&self, conn: &Connection) -> Result<RunOutcome> {
        let task = match db::get_task(conn, self.lease) {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(RunOutcome::Idle),
            Err(e) if e.is_busy() => {
                debug!("queue busy; skipping this poll");
                return Ok(RunOutcome::Idle);
            }
            Err(e) => return Err(e),
        };

        debug!(task_id = task.id, name = %task.name, "running task");
        match self.dispatch(conn, &task) {
            Ok(()) => {
                if !db::remove_task(conn, &task)? {
                    warn!(task_id = task.id, "lease expired before the task completed");
                }
                info!(task_id = task.id, name = %task.name, "task completed");
                Ok(RunOutcome::Completed(task.id))
            }
            Err(info) => {
                error!(task_id = task.id, name = %task.name, error = %info, "task failed");
                if !db::update_task(conn, &task, TaskStatus::Error, Some(&info))? {
                    warn!(task_id = task.id, "lease expired before the failure was recorded");
                }
                Ok(RunOutcome::Failed(task.id))
            }
        }
    }

    /// Run the task's handler, turning errors and panics into diagnostic text.
    fn dispatch(&self, conn: &Connection, task: &Task) -> std::result::Result<(), String> {
        let handler = self.handler(&task.name).map_err(|e| e.to_string())?;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.run(conn, &task.data))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(payload) => Err(format!("handler panicked: {}", panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// A polling loop over one connection.
pub struct Worker {
    conn: Connection,
    registry: TaskRegistry,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(conn: Connection, registry: TaskRegistry, poll_interval: Duration) -> Self {
        Self {
            conn,
            registry,
            poll_interval,
        }
    }

    /// Run tasks until the queue has nothing claimable. Returns how many
    /// tasks ran (completed or failed).
    pub fn drain(&self) -> Result<usize> {
        let mut ran = 0;
        while self.registry.run_once(&self.conn)? != RunOutcome::Idle {
            ran += 1;
        }
        Ok(ran)
    }

    /// Poll until `stop` fires or its sender goes away. A store error ends
    /// the loop and is returned.
    pub fn run(self, stop: Receiver<()>) -> Result<()> {
        info!(
            tasks = ?self.registry.names(),
            poll_ms = self.poll_interval.as_millis() as u64,
            lease_secs = self.registry.lease.as_secs(),
            "worker started"
        );
        loop {
            match stop.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let outcome = match self.registry.run_once(&self.conn) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "worker stopping on store error");
                    return Err(e);
                }
            };

            if outcome == RunOutcome::Idle {
                match stop.recv_timeout(self.poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
        info!("worker stopped");
        Ok(())
    }

    /// Run the loop on its own thread.
    pub fn spawn(self) -> Result<WorkerHandle> {
        let (stop, signal) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("covrelay-worker".to_string())
            .spawn(move || self.run(signal))?;
        Ok(WorkerHandle { stop, thread })
    }
}

/// How a worker thread ended after `WorkerHandle::stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Still busy after the grace period; the thread was detached.
    Abandoned,
}

/// Controls a spawned worker. Dropping the handle also stops the loop once
/// its current task finishes.
pub struct WorkerHandle {
    stop: Sender<()>,
    thread: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the loop exits on its own (store error or stop signal).
    pub fn wait(self) -> Result<()> {
        join(self.thread)
    }

    /// Ask the loop to stop and wait up to `grace` for its current task.
    pub fn stop(self, grace: Duration) -> Result<StopOutcome> {
        // The loop may already have exited and dropped its receiver.
        let _ = self.stop.send(());
        let deadline = Instant::now() + grace;
        while !self.thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(grace_ms = grace.as_millis() as u64, "worker did not stop in time; abandoning it");
                return Ok(StopOutcome::Abandoned);
            }
            thread::sleep(Duration::from_millis(10));
        }
        join(self.thread)?;
        Ok(StopOutcome::Stopped)
    }
}

fn join(thread: JoinHandle<Result<()>>) -> Result<()> {
    thread
        .join()
        .map_err(|payload| {
            RelayError::Other(format!("worker panicked: {}", panic_message(payload.as_ref())))
        })?
}
