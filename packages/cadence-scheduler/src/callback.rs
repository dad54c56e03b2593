//! Tasks whose body is an externally supplied function.
//!
//! A [`CallbackTask`] calls its function with a stored argument list, optionally
//! followed by a reference to the task itself, and maps the returned value to a
//! [`DoneStatus`]. It can also notify an owner object when it joins or leaves a
//! chain, call an `upon_death` function once it finishes, and carry arbitrary
//! named attributes for the script that created it.

use crate::error::{OwnerError, TaskError};
use crate::task::{DoneStatus, Task, TaskBody, TaskRef};
use crate::value::{Callable, Value};
use rustc_hash::FxHashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Attribute names handled by the task itself rather than the attribute map.
pub const RESERVED_ATTRIBUTES: [&str; 7] =
    ["delayTime", "name", "id", "time", "done", "cont", "again"];

/// Receives lifecycle notifications for the tasks it owns.
///
/// The default methods report the capability as missing; the task logs that
/// and carries on.
pub trait TaskOwner: Send + Sync {
    /// Called when an owned task joins a chain, or when this owner is attached
    /// to a task that is already scheduled.
    fn add_task(&self, _task: &TaskRef) -> Result<(), OwnerError> {
        Err(OwnerError::MissingMethod("add_task"))
    }

    /// Called when an owned task leaves its chain, or when this owner is
    /// detached from a task that is still scheduled.
    fn clear_task(&self, _task: &TaskRef) -> Result<(), OwnerError> {
        Err(OwnerError::MissingMethod("clear_task"))
    }

    /// Rendering used in diagnostics.
    fn describe(&self) -> String {
        "<owner>".to_string()
    }
}

struct CallbackState {
    function: Callable,
    args: Vec<Value>,
    append_task: bool,
    upon_death: Option<Callable>,
    owner: Option<Arc<dyn TaskOwner>>,
    attributes: FxHashMap<String, Value>,
}

pub struct CallbackBody {
    state: Mutex<CallbackState>,
}

impl CallbackBody {
    fn lock(&self) -> MutexGuard<'_, CallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call_args(&self, task: &TaskRef) -> Vec<Value> {
        let state = self.lock();
        let mut args = Vec::with_capacity(state.args.len() + 1);
        args.extend(state.args.iter().cloned());
        if state.append_task {
            args.push(Value::Task(task.clone()));
        }
        args
    }

    fn owner(&self) -> Option<Arc<dyn TaskOwner>> {
        self.lock().owner.clone()
    }
}

#[derive(Clone, Copy)]
enum OwnerHook {
    Add,
    Clear,
}

fn notify_owner(task: &TaskRef, owner: &dyn TaskOwner, hook: OwnerHook) {
    let result = match hook {
        OwnerHook::Add => owner.add_task(task),
        OwnerHook::Clear => owner.clear_task(task),
    };
    if let Err(err) = result {
        tracing::error!("owner {} of {}: {}", owner.describe(), task, err);
    }
}

impl TaskBody for CallbackBody {
    fn do_task(&self, task: &TaskRef) -> DoneStatus {
        let function = self.lock().function.clone();
        let args = self.call_args(task);
        let result = function.invoke(&args);
        drop(args);

        match result {
            Err(err) => {
                tracing::error!("Exception occurred in {}: {}", task, err);
                DoneStatus::Abort
            }
            Ok(Value::None) => DoneStatus::Done,
            Ok(value) => match value.as_int().and_then(DoneStatus::from_code) {
                Some(status) => status,
                None => {
                    tracing::error!("{} returned {}", task, value.repr());
                    DoneStatus::Abort
                }
            },
        }
    }

    fn upon_birth(&self, task: &TaskRef) {
        if let Some(owner) = self.owner() {
            notify_owner(task, owner.as_ref(), OwnerHook::Add);
        }
    }

    fn upon_death(&self, task: &TaskRef, _clean_exit: bool) {
        if let Some(owner) = self.owner() {
            notify_owner(task, owner.as_ref(), OwnerHook::Clear);
        }

        let upon_death = self.lock().upon_death.clone();
        if let Some(f) = upon_death {
            if let Err(err) = f.invoke(&[Value::Task(task.clone())]) {
                tracing::error!("upon_death of {} failed: {}", task, err);
            }
        }
    }
}

/// Create a callback task. See [`CallbackTask::new`].
pub fn new_task(function: Value, name: impl Into<String>) -> Result<CallbackTask, TaskError> {
    CallbackTask::new(function, name)
}

/// Handle to a task whose body is a [`CallbackBody`].
///
/// Dereferences to [`Task`] for the common task API.
#[derive(Clone)]
pub struct CallbackTask {
    task: TaskRef,
    body: Arc<CallbackBody>,
}

impl CallbackTask {
    /// `function` must be a [`Value::Callable`]. The task starts with no
    /// arguments, `append_task` enabled, no `upon_death` and no owner.
    pub fn new(function: Value, name: impl Into<String>) -> Result<Self, TaskError> {
        let name = name.into();
        let Value::Callable(function) = function else {
            return Err(TaskError::InvalidFunction {
                task: format!("task \"{name}\""),
                value: function.repr(),
            });
        };

        let body = Arc::new(CallbackBody {
            state: Mutex::new(CallbackState {
                function,
                args: Vec::new(),
                append_task: true,
                upon_death: None,
                owner: None,
                attributes: FxHashMap::default(),
            }),
        });
        let task = Task::with_body(name, body.clone());
        Ok(Self { task, body })
    }

    /// Recover the callback handle from a plain task reference, e.g. the
    /// self-reference passed as the last argument.
    pub fn from_task(task: &TaskRef) -> Option<Self> {
        task.body::<CallbackBody>().map(|body| Self {
            task: task.clone(),
            body,
        })
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn into_task(self) -> TaskRef {
        self.task
    }

    pub fn set_function(&self, function: Value) -> Result<(), TaskError> {
        match function {
            Value::Callable(f) => {
                self.body.lock().function = f;
                Ok(())
            }
            other => Err(TaskError::InvalidFunction {
                task: self.task.to_string(),
                value: other.repr(),
            }),
        }
    }

    pub fn function(&self) -> Value {
        Value::Callable(self.body.lock().function.clone())
    }

    /// `args` may be `None` (no arguments) or a sequence. With `append_task`
    /// the task appends a fresh reference to itself on every call; that
    /// reference is never stored. On error nothing changes.
    pub fn set_args(&self, args: Value, append_task: bool) -> Result<(), TaskError> {
        let args = match args {
            Value::None => Vec::new(),
            Value::Seq(items) => items,
            other => {
                return Err(TaskError::InvalidArgs {
                    task: self.task.to_string(),
                    value: other.repr(),
                });
            }
        };

        let mut state = self.body.lock();
        state.args = args;
        state.append_task = append_task;
        Ok(())
    }

    /// The arguments the next call will receive.
    pub fn args(&self) -> Vec<Value> {
        self.body.call_args(&self.task)
    }

    pub fn append_task(&self) -> bool {
        self.body.lock().append_task
    }

    pub fn set_upon_death(&self, upon_death: Value) -> Result<(), TaskError> {
        let upon_death = match upon_death {
            Value::None => None,
            Value::Callable(f) => Some(f),
            other => {
                return Err(TaskError::InvalidUponDeath {
                    task: self.task.to_string(),
                    value: other.repr(),
                });
            }
        };
        self.body.lock().upon_death = upon_death;
        Ok(())
    }

    pub fn upon_death(&self) -> Value {
        self.body
            .lock()
            .upon_death
            .clone()
            .map(Value::Callable)
            .unwrap_or(Value::None)
    }

    /// Replace the owner. While the task is scheduled, the outgoing owner gets
    /// `clear_task` and then the incoming owner gets `add_task`. Reattaching
    /// the current owner notifies nobody.
    pub fn set_owner(&self, owner: Option<Arc<dyn TaskOwner>>) {
        let scheduled = self.task.is_alive();
        let previous = std::mem::replace(&mut self.body.lock().owner, owner.clone());

        let unchanged = match (&previous, &owner) {
            (Some(previous), Some(owner)) => Arc::ptr_eq(previous, owner),
            (None, None) => true,
            _ => false,
        };
        if scheduled && !unchanged {
            if let Some(previous) = previous {
                notify_owner(&self.task, previous.as_ref(), OwnerHook::Clear);
            }
            if let Some(owner) = owner {
                notify_owner(&self.task, owner.as_ref(), OwnerHook::Add);
            }
        }
    }

    pub fn owner(&self) -> Option<Arc<dyn TaskOwner>> {
        self.body.owner()
    }

    pub fn get_attr(&self, name: &str) -> Result<Value, TaskError> {
        match name {
            "time" => Ok(Value::Float(self.task.elapsed_time())),
            "done" => Ok(Value::Int(DoneStatus::DONE)),
            "cont" => Ok(Value::Int(DoneStatus::CONT)),
            "again" => Ok(Value::Int(DoneStatus::AGAIN)),
            "name" => Ok(Value::Str(self.task.name())),
            "id" => Ok(Value::Int(self.task.id().as_u64() as i64)),
            "delayTime" => Ok(self.task.delay().map(Value::Float).unwrap_or(Value::None)),
            _ => self
                .body
                .lock()
                .attributes
                .get(name)
                .cloned()
                .ok_or_else(|| self.not_found(name)),
        }
    }

    pub fn set_attr(&self, name: &str, value: Value) -> Result<(), TaskError> {
        tracing::debug!("{}: task.{} = {}", self.task, name, value.repr());

        match name {
            "delayTime" => match value.as_float() {
                Some(delay) => {
                    self.task.set_delay(delay);
                    Ok(())
                }
                None => Err(self.invalid_value(name, &value)),
            },
            "name" => match value {
                Value::Str(s) => {
                    self.task.set_name(s);
                    Ok(())
                }
                other => Err(self.invalid_value(name, &other)),
            },
            "id" | "time" | "done" | "cont" | "again" => Err(TaskError::ImmutableAttribute {
                task: self.task.to_string(),
                attr: name.to_string(),
            }),
            _ => {
                self.body.lock().attributes.insert(name.to_string(), value);
                Ok(())
            }
        }
    }

    /// Remove an entry from the attribute map.
    pub fn del_attr(&self, name: &str) -> Result<(), TaskError> {
        match self.body.lock().attributes.remove(name) {
            Some(_) => Ok(()),
            None => Err(self.not_found(name)),
        }
    }

    fn not_found(&self, name: &str) -> TaskError {
        TaskError::AttributeNotFound {
            task: self.task.to_string(),
            attr: name.to_string(),
        }
    }

    fn invalid_value(&self, name: &str, value: &Value) -> TaskError {
        TaskError::InvalidAttributeValue {
            task: self.task.to_string(),
            attr: name.to_string(),
            value: value.repr(),
        }
    }
}

impl Deref for CallbackTask {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl std::fmt::Debug for CallbackTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.task, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::callable;

    #[test]
    fn test_new_rejects_non_callable() {
        let err = new_task(Value::Int(3), "bad").unwrap_err();
        assert!(matches!(err, TaskError::InvalidFunction { .. }));
    }

    #[test]
    fn test_reserved_names_are_intercepted() {
        let task = new_task(callable(|_| Ok(Value::None)), "reserved").unwrap();

        assert_eq!(task.get_attr("done").unwrap(), Value::Int(0));
        assert_eq!(task.get_attr("cont").unwrap(), Value::Int(1));
        assert_eq!(task.get_attr("again").unwrap(), Value::Int(2));
        assert_eq!(task.get_attr("name").unwrap(), Value::from("reserved"));
        assert_eq!(task.get_attr("time").unwrap(), Value::Float(0.0));
        assert!(task.get_attr("delayTime").unwrap().is_none());

        task.set_attr("delayTime", Value::Float(1.5)).unwrap();
        assert_eq!(task.delay(), Some(1.5));
        task.set_attr("name", "renamed".into()).unwrap();
        assert_eq!(task.name(), "renamed");

        assert!(matches!(
            task.set_attr("name", Value::Int(1)),
            Err(TaskError::InvalidAttributeValue { .. })
        ));
        assert!(matches!(
            task.set_attr("time", Value::Int(1)),
            Err(TaskError::ImmutableAttribute { .. })
        ));
        assert!(task.get_attr("time").is_ok());

        for name in RESERVED_ATTRIBUTES {
            assert!(task.del_attr(name).is_err());
        }
    }

    #[test]
    fn test_call_args_append_fresh_self() {
        let task = new_task(callable(|_| Ok(Value::None)), "args").unwrap();
        task.set_args(Value::Seq(vec![1.into()]), true).unwrap();

        let args = task.args();
        assert_eq!(args.len(), 2);
        assert_eq!(args[1].as_task().map(|t| t.id()), Some(task.id()));
        assert_eq!(task.body.lock().args.len(), 1);
    }
}
