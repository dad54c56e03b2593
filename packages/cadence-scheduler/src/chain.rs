use crate::config::ChainConfig;
use crate::error::TaskError;
use crate::manager::ManagerInner;
use crate::task::{DoneStatus, TaskRef, TaskState};
use slotmap::new_key_type;
use smallvec::SmallVec;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

new_key_type! {
    pub struct ChainId;
}

/// Result of asking a chain to drop a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detach {
    /// The task is not in this chain.
    NotFound,
    /// The task was idle and is gone; the caller fires its death hook.
    Removed,
    /// The task is running; it leaves when its body returns.
    Deferred,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub executed: usize,
    pub finished: usize,
    /// Runnable tasks left for the next pass because the frame budget ran out.
    pub deferred: usize,
}

#[derive(Default)]
struct ChainState {
    tasks: Vec<TaskRef>,
    next_seq: u64,
    passes: u64,
}

/// The runnable set for one execution context (a frame phase, a worker...).
///
/// Tasks run in priority order, highest first, ties broken by insertion order.
/// Each pass works from a snapshot taken when it starts, so tasks added while a
/// pass is underway wait for the next one. Every snapshot entry is checked again
/// right before it runs, so tasks removed mid-pass are skipped.
pub struct TaskChain {
    id: ChainId,
    name: String,
    frame_budget: Option<f64>,
    state: Mutex<ChainState>,
}

impl TaskChain {
    pub(crate) fn new(id: ChainId, config: &ChainConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            frame_budget: config.frame_budget,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum seconds one pass may spend before leaving the rest for later.
    pub fn frame_budget(&self) -> Option<f64> {
        self.frame_budget
    }

    pub fn num_tasks(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn passes(&self) -> u64 {
        self.lock().passes
    }

    pub fn has_task(&self, task: &TaskRef) -> bool {
        self.lock().tasks.iter().any(|t| Arc::ptr_eq(t, task))
    }

    /// Tasks in run order.
    pub fn tasks(&self) -> Vec<TaskRef> {
        let state = self.lock();
        let mut keyed: Vec<_> = state
            .tasks
            .iter()
            .map(|t| {
                let core = t.core();
                (core.priority, core.seq, t.clone())
            })
            .collect();
        sort_run_order(&mut keyed);
        keyed.into_iter().map(|(_, _, t)| t).collect()
    }

    pub(crate) fn insert(
        &self,
        task: &TaskRef,
        manager: &Arc<ManagerInner>,
        now: f64,
    ) -> Result<(), TaskError> {
        let mut state = self.lock();
        {
            let mut core = task.core();
            if core.state != TaskState::Inactive || core.chain.is_some() {
                drop(core);
                return Err(TaskError::AlreadyScheduled {
                    task: task.to_string(),
                });
            }

            core.chain = Some(self.id);
            core.clean_exit = None;
            core.manager = Arc::downgrade(manager);
            core.seq = state.next_seq;
            core.start_time = now;
            match core.delay {
                Some(delay) if delay > 0.0 => {
                    core.state = TaskState::Sleeping;
                    core.wake_time = now + delay;
                }
                _ => core.state = TaskState::Active,
            }
        }
        state.next_seq += 1;
        state.tasks.push(task.clone());
        manager.register(task);
        Ok(())
    }

    pub(crate) fn detach(&self, task: &TaskRef, manager: &ManagerInner) -> Detach {
        let mut state = self.lock();
        let mut core = task.core();
        if core.chain != Some(self.id) {
            return Detach::NotFound;
        }

        match core.state {
            TaskState::Active | TaskState::Sleeping => {
                core.state = TaskState::Inactive;
                core.chain = None;
                core.clean_exit = Some(false);
                drop(core);
                state.tasks.retain(|t| !Arc::ptr_eq(t, task));
                manager.unregister(task);
                Detach::Removed
            }
            TaskState::Servicing | TaskState::ServingAbort => {
                core.state = TaskState::ServingAbort;
                Detach::Deferred
            }
            TaskState::Inactive => Detach::NotFound,
        }
    }

    /// Drop every idle task; running ones are flagged to leave when they return.
    pub(crate) fn drain(&self, manager: &ManagerInner) -> Vec<TaskRef> {
        let tasks: Vec<TaskRef> = self.lock().tasks.clone();
        tasks
            .into_iter()
            .filter(|task| self.detach(task, manager) == Detach::Removed)
            .collect()
    }

    /// Earliest wake time among sleeping tasks.
    pub(crate) fn next_wake_time(&self) -> Option<f64> {
        self.lock()
            .tasks
            .iter()
            .filter_map(|t| {
                let core = t.core();
                (core.state == TaskState::Sleeping).then_some(core.wake_time)
            })
            .reduce(f64::min)
    }

    /// Run one pass over this chain.
    pub(crate) fn run_pass(&self, manager: &ManagerInner) -> PassStats {
        let now = manager.clock.now();
        let snapshot = self.begin_pass(now);
        let mut stats = PassStats::default();

        for (index, (seq, task)) in snapshot.iter().enumerate() {
            if let Some(budget) = self.frame_budget {
                if stats.executed > 0 && manager.clock.now() - now >= budget {
                    stats.deferred = snapshot.len() - index;
                    tracing::debug!(
                        "chain {} out of frame budget, {} tasks left for the next pass",
                        self.name,
                        stats.deferred
                    );
                    break;
                }
            }

            if !self.begin_service(task, *seq) {
                continue;
            }

            let status = task.service();
            stats.executed += 1;
            manager.record_execution();

            if let Some(clean_exit) = self.finish_service(task, status, manager) {
                if status == DoneStatus::Abort {
                    tracing::error!("{} aborted", task);
                }
                stats.finished += 1;
                task.fire_death(clean_exit);
            }
        }

        stats
    }

    fn begin_pass(&self, now: f64) -> SmallVec<[(u64, TaskRef); 16]> {
        let mut state = self.lock();
        state.passes += 1;

        let mut runnable: Vec<(i32, u64, TaskRef)> = Vec::with_capacity(state.tasks.len());
        for task in &state.tasks {
            let mut core = task.core();
            if core.state == TaskState::Sleeping && core.wake_time <= now {
                core.state = TaskState::Active;
                core.start_time = now;
            }
            if core.state == TaskState::Active {
                runnable.push((core.priority, core.seq, task.clone()));
            }
        }

        sort_run_order(&mut runnable);
        runnable.into_iter().map(|(_, seq, t)| (seq, t)).collect()
    }

    // A task removed and re-added since the snapshot carries a new seq and
    // waits for the next pass.
    fn begin_service(&self, task: &TaskRef, seq: u64) -> bool {
        let _state = self.lock();
        let mut core = task.core();
        if core.chain != Some(self.id) || core.seq != seq || core.state != TaskState::Active {
            return false;
        }
        core.state = TaskState::Servicing;
        core.run_count += 1;
        true
    }

    /// Apply the outcome of one execution step.
    /// Returns the `clean_exit` flag when the task left the chain.
    fn finish_service(
        &self,
        task: &TaskRef,
        status: DoneStatus,
        manager: &ManagerInner,
    ) -> Option<bool> {
        let now = manager.clock.now();
        let mut state = self.lock();
        let mut core = task.core();

        let exit = if core.state == TaskState::ServingAbort {
            Some(false)
        } else {
            match status {
                DoneStatus::Cont => {
                    core.state = TaskState::Active;
                    None
                }
                DoneStatus::Again => {
                    core.start_time = now;
                    match core.delay {
                        Some(delay) if delay > 0.0 => {
                            core.state = TaskState::Sleeping;
                            core.wake_time = now + delay;
                        }
                        _ => core.state = TaskState::Active,
                    }
                    None
                }
                DoneStatus::Done => Some(true),
                DoneStatus::Abort => Some(false),
            }
        };

        if exit.is_some() {
            core.state = TaskState::Inactive;
            core.chain = None;
            core.clean_exit = exit;
            drop(core);
            state.tasks.retain(|t| !Arc::ptr_eq(t, task));
            manager.unregister(task);
        }
        exit
    }
}

fn sort_run_order(entries: &mut [(i32, u64, TaskRef)]) {
    entries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
}

impl std::fmt::Debug for TaskChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskChain")
            .field("name", &self.name)
            .field("frame_budget", &self.frame_budget)
            .field("num_tasks", &self.num_tasks())
            .finish()
    }
}
