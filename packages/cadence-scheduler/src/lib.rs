//! Cooperative task scheduling for frame-driven engines.
//!
//! A [`TaskManager`] owns named [`TaskChain`]s. Each call to
//! [`TaskManager::poll`] runs one pass over every chain: runnable tasks execute
//! in priority order and report a [`DoneStatus`] that decides whether they run
//! again next pass, sleep for their delay, or leave the chain.
//!
//! Task bodies are either native ([`TaskBody`], [`FnTask`]) or externally
//! supplied functions wrapped in a [`CallbackTask`].

pub mod callback;
pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod inspect;
pub mod manager;
pub mod task;
pub mod value;

pub use callback::{CallbackTask, TaskOwner, new_task};
pub use chain::{ChainId, PassStats, TaskChain};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ChainConfig, ManagerConfig};
pub use error::{CallError, ConfigError, OwnerError, TaskError};
pub use inspect::{ChainSnapshot, ManagerSnapshot, TaskSnapshot};
pub use manager::TaskManager;
pub use task::{DoneStatus, FnTask, Task, TaskBody, TaskId, TaskRef, TaskState};
pub use value::{Callable, Invocable, Value, callable};
