use crate::chain::{ChainId, Detach, PassStats, TaskChain};
use crate::clock::{Clock, SystemClock};
use crate::config::{ChainConfig, ManagerConfig};
use crate::error::TaskError;
use crate::inspect::{ChainSnapshot, ManagerSnapshot};
use crate::task::{TaskId, TaskRef, TaskState};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

#[derive(Default)]
struct Chains {
    slots: SlotMap<ChainId, Arc<TaskChain>>,
    by_name: FxHashMap<String, ChainId>,
}

pub(crate) struct ManagerInner {
    pub name: String,
    pub clock: Arc<dyn Clock>,
    config: ManagerConfig,
    chains: RwLock<Chains>,
    registry: Mutex<FxHashMap<TaskId, TaskRef>>,
    passes: AtomicU64,
    tasks_executed: AtomicU64,
}

impl ManagerInner {
    fn registry(&self) -> MutexGuard<'_, FxHashMap<TaskId, TaskRef>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, task: &TaskRef) {
        self.registry().insert(task.id(), task.clone());
    }

    pub(crate) fn unregister(&self, task: &TaskRef) {
        self.registry().remove(&task.id());
    }

    pub(crate) fn record_execution(&self) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    fn all_chains(&self) -> Vec<Arc<TaskChain>> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .values()
            .cloned()
            .collect()
    }

    // Death hooks fire after each chain releases its lock.
    fn drain_all(&self) -> usize {
        let mut removed = 0;
        for chain in self.all_chains() {
            let drained = chain.drain(self);
            removed += drained.len();
            for task in drained {
                task.fire_death(false);
            }
        }
        removed
    }

    fn chain_by_id(&self, id: ChainId) -> Option<Arc<TaskChain>> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .get(id)
            .cloned()
    }
}

// Tasks still scheduled when the last handle goes away leave with clean_exit = false.
impl Drop for ManagerInner {
    fn drop(&mut self) {
        let removed = self.drain_all();
        if removed > 0 {
            tracing::info!(
                "TaskManager {} dropped with {} tasks still scheduled",
                self.name,
                removed
            );
        }
    }
}

/// Owns the task chains and the registry of every scheduled task.
///
/// Cloning is cheap; all clones drive the same manager. Tasks only hold a weak
/// reference back, so dropping the last handle tears the manager down and
/// retires every task still scheduled, firing its death hook.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: ManagerConfig, clock: Arc<dyn Clock>) -> Self {
        let manager = Self {
            inner: Arc::new(ManagerInner {
                name: config.name.clone(),
                clock,
                config: config.clone(),
                chains: RwLock::new(Chains::default()),
                registry: Mutex::new(FxHashMap::default()),
                passes: AtomicU64::new(0),
                tasks_executed: AtomicU64::new(0),
            }),
        };

        manager.make_task_chain(&config.default_chain);
        for chain in &config.chains {
            manager.install_chain(chain);
        }

        tracing::info!(
            "TaskManager {} created with {} chains",
            manager.inner.name,
            manager.chains().len()
        );
        manager
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn now(&self) -> f64 {
        self.inner.clock.now()
    }

    // Existing chains win; a later config for the same name is ignored.
    // The flag is false when the chain already existed.
    fn install_chain(&self, config: &ChainConfig) -> (Arc<TaskChain>, bool) {
        let mut chains = self
            .inner
            .chains
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = chains.by_name.get(&config.name) {
            return (chains.slots[id].clone(), false);
        }

        let id = chains
            .slots
            .insert_with_key(|id| Arc::new(TaskChain::new(id, config)));
        chains.by_name.insert(config.name.clone(), id);
        tracing::debug!("created task chain {}", config.name);
        (chains.slots[id].clone(), true)
    }

    /// Get the chain with this name, creating it if needed.
    pub fn make_task_chain(&self, name: &str) -> Arc<TaskChain> {
        self.install_chain(&ChainConfig::new(name)).0
    }

    /// Create a chain from explicit settings. Fails if the name is taken.
    pub fn add_task_chain(&self, config: ChainConfig) -> Result<Arc<TaskChain>, TaskError> {
        match self.install_chain(&config) {
            (chain, true) => Ok(chain),
            (_, false) => Err(TaskError::DuplicateChain { name: config.name }),
        }
    }

    pub fn find_task_chain(&self, name: &str) -> Option<Arc<TaskChain>> {
        let chains = self.inner.chains.read().unwrap_or_else(PoisonError::into_inner);
        chains
            .by_name
            .get(name)
            .and_then(|&id| chains.slots.get(id))
            .cloned()
    }

    /// Chains in creation order.
    pub fn chains(&self) -> Vec<Arc<TaskChain>> {
        self.inner.all_chains()
    }

    /// Schedule a task on its chosen chain (or the default chain) and fire its birth hook.
    pub fn add(&self, task: &TaskRef) -> Result<(), TaskError> {
        let chain_name = task
            .chain_name()
            .unwrap_or_else(|| self.inner.config.default_chain.clone());
        let chain = self.make_task_chain(&chain_name);

        chain.insert(task, &self.inner, self.inner.clock.now())?;
        tracing::debug!("added {} to chain {}", task, chain.name());
        task.fire_birth();
        Ok(())
    }

    /// Take a task out of the active set.
    ///
    /// Idle tasks leave immediately and their death hook fires before this
    /// returns. A task whose body is running (for instance one removing itself)
    /// leaves as soon as the body returns. Either way `clean_exit` is false.
    /// Returns false if the task was not scheduled here.
    pub fn remove(&self, task: &TaskRef) -> bool {
        let chain_id = {
            let core = task.core();
            match (core.chain, core.manager.upgrade()) {
                (Some(id), Some(owner)) if Arc::ptr_eq(&owner, &self.inner) => id,
                _ => return false,
            }
        };
        let Some(chain) = self.inner.chain_by_id(chain_id) else {
            return false;
        };

        match chain.detach(task, &self.inner) {
            Detach::NotFound => false,
            Detach::Removed => {
                tracing::debug!("removed {} from chain {}", task, chain.name());
                task.fire_death(false);
                true
            }
            Detach::Deferred => {
                tracing::debug!("{} will leave chain {} when it returns", task, chain.name());
                true
            }
        }
    }

    /// Remove every scheduled task. Returns how many were removed.
    pub fn remove_all(&self) -> usize {
        let removed = self.inner.drain_all();
        tracing::info!("TaskManager {} removed {} tasks", self.inner.name, removed);
        removed
    }

    /// Run one pass over every chain.
    pub fn poll(&self) -> PassStats {
        let chains = self.chains();
        self.inner.passes.fetch_add(1, Ordering::Relaxed);

        let results: Vec<PassStats> = if self.inner.config.parallel_chains && chains.len() > 1 {
            let inner = &*self.inner;
            std::thread::scope(|scope| {
                let handles: Vec<_> = chains
                    .iter()
                    .map(|chain| scope.spawn(move || chain.run_pass(inner)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or_default())
                    .collect()
            })
        } else {
            chains.iter().map(|chain| chain.run_pass(&self.inner)).collect()
        };

        results.into_iter().fold(PassStats::default(), |acc, s| PassStats {
            executed: acc.executed + s.executed,
            finished: acc.finished + s.finished,
            deferred: acc.deferred + s.deferred,
        })
    }

    pub fn has_task(&self, task: &TaskRef) -> bool {
        self.inner.registry().contains_key(&task.id())
    }

    pub fn num_tasks(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn get_task(&self, id: TaskId) -> Option<TaskRef> {
        self.inner.registry().get(&id).cloned()
    }

    /// All scheduled tasks, ordered by id.
    pub fn tasks(&self) -> Vec<TaskRef> {
        let mut tasks: Vec<TaskRef> = self.inner.registry().values().cloned().collect();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    /// Scheduled tasks that are not sleeping.
    pub fn active_tasks(&self) -> Vec<TaskRef> {
        self.tasks_where(|state| state != TaskState::Sleeping)
    }

    pub fn sleeping_tasks(&self) -> Vec<TaskRef> {
        self.tasks_where(|state| state == TaskState::Sleeping)
    }

    fn tasks_where(&self, keep: impl Fn(TaskState) -> bool) -> Vec<TaskRef> {
        self.tasks().into_iter().filter(|t| keep(t.state())).collect()
    }

    /// The first scheduled task (lowest id) with this name.
    pub fn find_task(&self, name: &str) -> Option<TaskRef> {
        self.find_tasks(name).into_iter().next()
    }

    pub fn find_tasks(&self, name: &str) -> Vec<TaskRef> {
        self.tasks().into_iter().filter(|t| t.name() == name).collect()
    }

    /// Tasks whose name matches `pattern`, where a trailing `*` matches any suffix.
    pub fn find_tasks_matching(&self, pattern: &str) -> Vec<TaskRef> {
        match pattern.strip_suffix('*') {
            Some(prefix) => self
                .tasks()
                .into_iter()
                .filter(|t| t.name().starts_with(prefix))
                .collect(),
            None => self.find_tasks(pattern),
        }
    }

    /// Earliest time a sleeping task wakes up, if any are sleeping.
    pub fn next_wake_time(&self) -> Option<f64> {
        self.chains()
            .iter()
            .filter_map(|c| c.next_wake_time())
            .reduce(f64::min)
    }

    /// Number of `poll` calls so far.
    pub fn passes(&self) -> u64 {
        self.inner.passes.load(Ordering::Relaxed)
    }

    /// Number of task bodies executed so far.
    pub fn tasks_executed(&self) -> u64 {
        self.inner.tasks_executed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let now = self.now();
        ManagerSnapshot {
            name: self.inner.name.clone(),
            now,
            passes: self.passes(),
            tasks_executed: self.tasks_executed(),
            chains: self
                .chains()
                .iter()
                .map(|chain| ChainSnapshot::capture(chain))
                .collect(),
        }
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("name", &self.inner.name)
            .field("num_tasks", &self.num_tasks())
            .field("passes", &self.passes())
            .finish()
    }
}
