//! Task functions, the registry that names them, and the outcome of running one.

use crate::Result;
use crate::proxy::{BarProxy, ProgressFactory};
use core::fmt::{Debug, Display, Formatter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Signature of a task body.
///
/// A task receives its arguments, a factory for its own progress bars, and a proxy for the
/// global bar shared by every task of the run. Returning a falsy value marks the task as
/// failed without being an error.
pub type TaskFn = dyn Fn(&Value, &ProgressFactory, &BarProxy) -> Result<Value> + Send + Sync;

/// Named task bodies that can be dispatched to workers.
///
/// Process workers re-execute the current program, so tasks are referred to by name rather
/// than by value; the coordinator and every worker build the same registry.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Arc<TaskFn>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task body under `name`, replacing any previous registration.
    #[must_use]
    pub fn with<F>(mut self, name: impl Into<String>, task: F) -> Self
    where
        F: Fn(&Value, &ProgressFactory, &BarProxy) -> Result<Value> + Send + Sync + 'static,
    {
        let _ = self.tasks.insert(name.into(), Arc::new(task));
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<TaskFn>> {
        self.tasks.get(name).map(Arc::clone)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

impl Debug for TaskRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskRegistry").field("tasks", &self.names().collect::<Vec<_>>()).finish()
    }
}

/// One unit of work: an operation name and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub operation: String,
    pub args: Value,
}

impl Task {
    #[must_use]
    pub fn new(operation: impl Into<String>, args: Value) -> Self {
        Self {
            operation: operation.into(),
            args,
        }
    }
}

/// What became of a dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task body returned a value, which may still be falsy.
    Completed(Value),

    /// The task body returned an error or panicked, or the operation is unknown.
    Failed { reason: String },

    /// The worker running the task went away before reporting back.
    Lost { reason: String },
}

impl TaskOutcome {
    /// A task succeeds only when it completed with a truthy value.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(value) if is_truthy(value))
    }
}

impl Display for TaskOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Completed(value) => write!(f, "{value}"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Lost { reason } => write!(f, "lost: {reason}"),
        }
    }
}

/// Truthiness of a task result: `null`, `false`, zero, and empty strings, arrays and objects
/// are falsy; everything else is truthy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// Run the task registered under `operation`.
///
/// Errors and panics raised by the task body are turned into [`TaskOutcome::Failed`] so that
/// one misbehaving task never takes down its worker.
#[must_use]
pub fn execute(registry: &TaskRegistry, operation: &str, args: &Value, progress: &ProgressFactory, global: &BarProxy) -> TaskOutcome {
    let Some(task) = registry.get(operation) else {
        return TaskOutcome::Failed {
            reason: format!("unknown operation '{operation}'"),
        };
    };

    match panic::catch_unwind(AssertUnwindSafe(|| task(args, progress, global))) {
        Ok(Ok(value)) => TaskOutcome::Completed(value),
        Ok(Err(e)) => TaskOutcome::Failed { reason: format!("{e:#}") },
        Err(payload) => TaskOutcome::Failed {
            reason: format!("task panicked: {}", panic_message(payload.as_ref())),
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::proxy::{BarIds, FrameSink};
    use ohno::app_err;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct VecSink(Mutex<Vec<Frame>>);

    impl FrameSink for VecSink {
        fn emit(&self, frame: Frame) {
            self.0.lock().unwrap().push(frame);
        }
    }

    fn run(registry: &TaskRegistry, operation: &str, args: &Value) -> TaskOutcome {
        let sink: Arc<dyn FrameSink> = Arc::new(VecSink::default());
        let factory = ProgressFactory::new(Arc::clone(&sink), BarIds::default());
        let global = BarProxy::global(sink);
        execute(registry, operation, args, &factory, &global)
    }

    #[test]
    fn truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!(0.0), json!(""), json!([]), json!({})] {
            assert!(!is_truthy(&falsy), "{falsy} should be falsy");
        }

        for truthy in [json!(true), json!(1), json!(-2.5), json!("x"), json!([0]), json!({ "a": null })] {
            assert!(is_truthy(&truthy), "{truthy} should be truthy");
        }
    }

    #[test]
    fn success_requires_truthy_completion() {
        assert!(TaskOutcome::Completed(json!(true)).is_success());
        assert!(!TaskOutcome::Completed(json!(false)).is_success());
        assert!(!TaskOutcome::Failed { reason: "x".into() }.is_success());
        assert!(!TaskOutcome::Lost { reason: "x".into() }.is_success());
    }

    #[test]
    fn execute_passes_arguments() {
        let registry = TaskRegistry::new().with("double", |args, _, _| Ok(json!(args["n"].as_u64().unwrap_or(0) * 2)));
        assert_eq!(run(&registry, "double", &json!({ "n": 21 })), TaskOutcome::Completed(json!(42)));
    }

    #[test]
    fn execute_converts_errors() {
        let registry = TaskRegistry::new().with("broken", |_, _, _| Err(app_err!("disk on fire")));
        let TaskOutcome::Failed { reason } = run(&registry, "broken", &Value::Null) else {
            panic!("expected failure");
        };
        assert!(reason.contains("disk on fire"), "{reason}");
    }

    #[test]
    fn execute_converts_panics() {
        let registry = TaskRegistry::new().with("explodes", |_, _, _| panic!("kaboom"));
        let TaskOutcome::Failed { reason } = run(&registry, "explodes", &Value::Null) else {
            panic!("expected failure");
        };
        assert!(reason.contains("kaboom"), "{reason}");
    }

    #[test]
    fn execute_unknown_operation() {
        let outcome = run(&TaskRegistry::new(), "missing", &Value::Null);
        assert_eq!(
            outcome,
            TaskOutcome::Failed {
                reason: "unknown operation 'missing'".into()
            }
        );
    }

    #[test]
    fn registry_lookup() {
        let registry = TaskRegistry::new().with("a", |_, _, _| Ok(Value::Null)).with("b", |_, _, _| Ok(Value::Null));
        assert!(registry.contains("a"));
        assert!(!registry.contains("c"));
        assert_eq!(registry.names().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn outcome_display() {
        assert_eq!(TaskOutcome::Completed(json!(true)).to_string(), "true");
        assert_eq!(TaskOutcome::Lost { reason: "gone".into() }.to_string(), "lost: gone");
    }
}
