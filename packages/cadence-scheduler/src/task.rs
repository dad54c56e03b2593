use crate::chain::ChainId;
use crate::error::TaskError;
use crate::manager::{ManagerInner, TaskManager};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique task identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Not in any chain.
    Inactive,
    /// Scheduled and runnable on the next pass.
    Active,
    /// Scheduled, waiting for its wake time.
    Sleeping,
    /// Body is executing right now.
    Servicing,
    /// Body is executing and the task has been asked to leave the chain.
    ServingAbort,
}

/// What a task body reports after one execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoneStatus {
    /// Finished; leave the chain with a clean exit.
    Done,
    /// Run again on the next pass.
    Cont,
    /// Run again after the task's delay, restarting its timer.
    Again,
    /// Failed; leave the chain without a clean exit.
    Abort,
}

impl DoneStatus {
    pub const DONE: i64 = 0;
    pub const CONT: i64 = 1;
    pub const AGAIN: i64 = 2;
    /// Older scripts return -1 to finish.
    pub const LEGACY_DONE: i64 = -1;

    /// Map a status code returned by a script. Abort is never accepted from outside.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            Self::DONE | Self::LEGACY_DONE => Some(DoneStatus::Done),
            Self::CONT => Some(DoneStatus::Cont),
            Self::AGAIN => Some(DoneStatus::Again),
            _ => None,
        }
    }
}

/// The work a task performs.
///
/// `do_task` runs with no scheduler locks held, so it may add or remove tasks,
/// including the task it belongs to. The lifecycle hooks run the same way.
pub trait TaskBody: Send + Sync + 'static {
    fn do_task(&self, task: &TaskRef) -> DoneStatus;

    /// Called after the task joins a chain.
    fn upon_birth(&self, _task: &TaskRef) {}

    /// Called after the task leaves its chain. `clean_exit` is true only when
    /// the body itself returned [`DoneStatus::Done`].
    fn upon_death(&self, _task: &TaskRef, _clean_exit: bool) {}
}

/// Adapts a plain closure into a [`TaskBody`].
pub struct FnTask<F>(pub F);

impl<F> TaskBody for FnTask<F>
where
    F: Fn(&TaskRef) -> DoneStatus + Send + Sync + 'static,
{
    fn do_task(&self, task: &TaskRef) -> DoneStatus {
        (self.0)(task)
    }
}

pub type TaskRef = Arc<Task>;

pub(crate) struct TaskCore {
    pub name: String,
    pub priority: i32,
    pub delay: Option<f64>,
    pub state: TaskState,
    pub chain: Option<ChainId>,
    pub chain_name: Option<String>,
    pub manager: Weak<ManagerInner>,
    pub start_time: f64,
    pub wake_time: f64,
    pub seq: u64,
    pub run_count: u64,
    pub clean_exit: Option<bool>,
}

pub struct Task {
    id: TaskId,
    core: Mutex<TaskCore>,
    body: Arc<dyn TaskBody>,
    any_body: Arc<dyn Any + Send + Sync>,
}

impl Task {
    pub fn new<B: TaskBody>(name: impl Into<String>, body: B) -> TaskRef {
        Self::with_body(name, Arc::new(body))
    }

    /// Build a task around a body the caller keeps a handle to.
    pub fn with_body<B: TaskBody>(name: impl Into<String>, body: Arc<B>) -> TaskRef {
        Arc::new(Self {
            id: TaskId::next(),
            core: Mutex::new(TaskCore {
                name: name.into(),
                priority: 0,
                delay: None,
                state: TaskState::Inactive,
                chain: None,
                chain_name: None,
                manager: Weak::new(),
                start_time: 0.0,
                wake_time: 0.0,
                seq: 0,
                run_count: 0,
                clean_exit: None,
            }),
            body: body.clone(),
            any_body: body,
        })
    }

    pub fn from_fn<F>(name: impl Into<String>, f: F) -> TaskRef
    where
        F: Fn(&TaskRef) -> DoneStatus + Send + Sync + 'static,
    {
        Self::new(name, FnTask(f))
    }

    // Never format a task while holding this guard: Display takes it too.
    pub(crate) fn core(&self) -> MutexGuard<'_, TaskCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Downcast the body to its concrete type.
    pub fn body<B: TaskBody>(&self) -> Option<Arc<B>> {
        self.any_body.clone().downcast::<B>().ok()
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> String {
        self.core().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.core().name = name.into();
    }

    pub fn priority(&self) -> i32 {
        self.core().priority
    }

    /// Higher priorities run earlier within a pass. Takes effect on the next pass.
    pub fn set_priority(&self, priority: i32) {
        self.core().priority = priority;
    }

    pub fn delay(&self) -> Option<f64> {
        self.core().delay
    }

    pub fn has_delay(&self) -> bool {
        self.core().delay.is_some()
    }

    /// Negative delays are treated as zero.
    pub fn set_delay(&self, seconds: f64) {
        self.core().delay = Some(seconds.max(0.0));
    }

    pub fn clear_delay(&self) {
        self.core().delay = None;
    }

    pub fn state(&self) -> TaskState {
        self.core().state
    }

    pub fn is_alive(&self) -> bool {
        self.state() != TaskState::Inactive
    }

    pub fn run_count(&self) -> u64 {
        self.core().run_count
    }

    /// How the last activation ended: `Some(true)` when the body returned
    /// `Done`, `Some(false)` for aborts and removals, `None` while scheduled
    /// or never scheduled.
    pub fn clean_exit(&self) -> Option<bool> {
        self.core().clean_exit
    }

    pub fn start_time(&self) -> f64 {
        self.core().start_time
    }

    /// Seconds since the task last became runnable. Zero while inactive.
    pub fn elapsed_time(&self) -> f64 {
        let (manager, start, state) = {
            let core = self.core();
            (core.manager.upgrade(), core.start_time, core.state)
        };
        match (state, manager) {
            (TaskState::Inactive, _) | (_, None) => 0.0,
            (_, Some(manager)) => (manager.clock.now() - start).max(0.0),
        }
    }

    pub fn wake_time(&self) -> Option<f64> {
        let core = self.core();
        (core.state == TaskState::Sleeping).then_some(core.wake_time)
    }

    pub fn chain_name(&self) -> Option<String> {
        self.core().chain_name.clone()
    }

    /// Choose the chain this task joins on its next `add`.
    pub fn set_task_chain(&self, chain: impl Into<String>) -> Result<(), TaskError> {
        let mut core = self.core();
        if core.state != TaskState::Inactive {
            return Err(TaskError::TaskBusy {
                task: format!("task \"{}\" #{}", core.name, self.id),
            });
        }
        core.chain_name = Some(chain.into());
        Ok(())
    }

    /// The manager this task is (or was last) scheduled on.
    pub fn manager(&self) -> Option<TaskManager> {
        self.core().manager.upgrade().map(TaskManager::from_inner)
    }

    /// Remove the task from whatever manager is running it.
    /// Returns false if it was not scheduled.
    pub fn remove(self: &Arc<Self>) -> bool {
        match self.manager() {
            Some(manager) => manager.remove(self),
            None => false,
        }
    }

    /// Run one execution step. A panicking body counts as an abort.
    pub(crate) fn service(self: &Arc<Self>) -> DoneStatus {
        match panic::catch_unwind(AssertUnwindSafe(|| self.body.do_task(self))) {
            Ok(status) => status,
            Err(_) => {
                tracing::error!("{} panicked while running", self);
                DoneStatus::Abort
            }
        }
    }

    pub(crate) fn fire_birth(self: &Arc<Self>) {
        tracing::debug!("{} born", self);
        if panic::catch_unwind(AssertUnwindSafe(|| self.body.upon_birth(self))).is_err() {
            tracing::error!("{} panicked in upon_birth", self);
        }
    }

    pub(crate) fn fire_death(self: &Arc<Self>, clean_exit: bool) {
        tracing::debug!("{} died (clean_exit = {})", self, clean_exit);
        if panic::catch_unwind(AssertUnwindSafe(|| self.body.upon_death(self, clean_exit))).is_err()
        {
            tracing::error!("{} panicked in upon_death", self);
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task \"{}\" #{}", self.core().name, self.id)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &core.name)
            .field("state", &core.state)
            .field("priority", &core.priority)
            .field("delay", &core.delay)
            .finish()
    }
}
