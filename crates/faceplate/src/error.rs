//! Error taxonomy and the bounded runtime-error log.
//!
//! Nothing in the engine core throws out to the caller of
//! `evaluate_all_bindings` or `register_notifications`; failures become
//! entries in the runtime-error log plus a safe fallback value. The enums
//! here are what the internal `Result` plumbing carries before that
//! conversion happens at the public API boundary.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tracing::warn;
use ulid::Ulid;

/// Result alias for internal engine plumbing.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures reported by the data-store collaborator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    EntityNotFound(Arc<str>),

    #[error("field not found: {entity}.{field}")]
    FieldNotFound { entity: Arc<str>, field: Arc<str> },

    #[error("field {entity}.{field} does not hold an entity reference")]
    NotAReference { entity: Arc<str>, field: Arc<str> },

    #[error("unknown subscription token: {0}")]
    UnknownSubscription(Ulid),

    #[error("store transport failure: {0}")]
    Transport(String),
}

/// Failures raised while compiling or running sandboxed scripts.
#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    #[error("parse error in {context}: {message}")]
    Parse { context: String, message: String },

    #[error("unknown identifier: {0}")]
    UnknownIdentifier(Arc<str>),

    #[error("unknown function: {0}")]
    UnknownFunction(Arc<str>),

    #[error("unknown module: {0}")]
    UnknownModule(Arc<str>),

    #[error("{function} expects {expected} argument(s), got {got}")]
    Arity {
        function: Arc<str>,
        expected: usize,
        got: usize,
    },

    #[error("type error: {0}")]
    Type(String),

    #[error("call depth limit exceeded")]
    CallDepth,

    #[error("no entity bound")]
    UnboundEntity,

    #[error("dependency {key} failed: {message}")]
    Dependency { key: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures surfaced by binding evaluation.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("expression cycle through {0}")]
    Cycle(String),

    #[error("not a literal: {0}")]
    InvalidLiteral(Arc<str>),

    #[error("no entity bound")]
    UnboundEntity,

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures reported by the persistence collaborator.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("io failure: {0}")]
    Io(String),

    #[error("malformed record: {0}")]
    Format(String),
}

/// A recorded compile failure: script module, binding script or transform.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub context: Arc<str>,
    pub message: String,
    pub timestamp: SystemTime,
}

impl CompileError {
    pub fn new(context: impl Into<Arc<str>>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// One entry in the runtime-error log.
#[derive(Debug, Clone)]
pub struct RuntimeErrorEntry {
    pub context: Arc<str>,
    pub message: String,
    pub timestamp: SystemTime,
}

/// Bounded FIFO log of runtime failures: evaluation, registration and event
/// errors all land here. Oldest entries are dropped once the cap is reached.
#[derive(Debug)]
pub struct ErrorLog {
    entries: RefCell<VecDeque<RuntimeErrorEntry>>,
    capacity: usize,
}

impl ErrorLog {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RefCell::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn push(&self, context: impl Into<Arc<str>>, message: impl ToString) {
        let context = context.into();
        let message = message.to_string();
        warn!(%context, %message, "runtime error");
        let mut entries = self.entries.borrow_mut();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(RuntimeErrorEntry {
            context,
            message,
            timestamp: SystemTime::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Point-in-time copy of the log contents, oldest first.
    pub fn snapshot(&self) -> Vec<RuntimeErrorEntry> {
        self.entries.borrow().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_log_is_bounded() {
        let log = ErrorLog::new(3);
        for i in 0..5 {
            log.push("test", format!("failure {i}"));
        }
        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "failure 2");
        assert_eq!(entries[2].message, "failure 4");
    }
}
