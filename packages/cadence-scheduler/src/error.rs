use thiserror::Error;

/// Configuration and lookup failures surfaced directly to the caller.
///
/// Execution failures never show up here: a failing task body is turned into
/// an abort by the chain that ran it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("invalid function passed to {task}: {value} is not callable")]
    InvalidFunction { task: String, value: String },

    #[error("invalid args passed to {task}: {value} is not a sequence")]
    InvalidArgs { task: String, value: String },

    #[error("invalid upon_death function passed to {task}: {value} is not callable")]
    InvalidUponDeath { task: String, value: String },

    #[error("cannot set constant value {task}.{attr}")]
    ImmutableAttribute { task: String, attr: String },

    #[error("invalid value {value} for {task}.{attr}")]
    InvalidAttributeValue {
        task: String,
        attr: String,
        value: String,
    },

    #[error("{task} has no attribute {attr}")]
    AttributeNotFound { task: String, attr: String },

    #[error("{task} is already scheduled")]
    AlreadyScheduled { task: String },

    #[error("{task} cannot change chains while scheduled")]
    TaskBusy { task: String },

    #[error("task chain {name} already exists")]
    DuplicateChain { name: String },
}

/// Failure raised by an externally supplied callable.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct CallError {
    message: String,
}

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

// Lets script callbacks use `?` on task API calls.
impl From<TaskError> for CallError {
    fn from(err: TaskError) -> Self {
        CallError::new(err.to_string())
    }
}

/// Failure reported by a task owner's lifecycle methods.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OwnerError {
    #[error("owner has no method {0}()")]
    MissingMethod(&'static str),

    #[error("owner {method}() failed: {message}")]
    Failed {
        method: &'static str,
        message: String,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse scheduler config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid scheduler config: {0}")]
    Invalid(String),
}
