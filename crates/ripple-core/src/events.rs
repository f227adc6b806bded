//! Observability sinks and the info events emitted by the engine.
//!
//! The engine reports through two pluggable callbacks: `on_error` for
//! failures that should page someone, and `on_info` for lifecycle events.
//! Defaults log through `tracing`.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Event codes emitted by the engine.
pub const CODE_REACTIVE_TASK_STARTED: &str = "REACTIVE_TASK_STARTED";
pub const CODE_REACTIVE_TASK_FINISHED: &str = "REACTIVE_TASK_FINISHED";
pub const CODE_REACTIVE_TASK_FAILED: &str = "REACTIVE_TASK_FAILED";
pub const CODE_REACTIVE_TASK_PLANNER_STARTED: &str = "REACTIVE_TASK_PLANNER_STARTED";
pub const CODE_REACTIVE_TASK_STREAM_ERROR: &str = "REACTIVE_TASK_STREAM_ERROR";
pub const CODE_REACTIVE_TASK_RECONCILIATION_STARTED: &str = "REACTIVE_TASK_RECONCILIATION_STARTED";
pub const CODE_REACTIVE_TASK_RECONCILIATION_FINISHED: &str =
    "REACTIVE_TASK_RECONCILIATION_FINISHED";
pub const CODE_REACTIVE_TASK_CLEANUP: &str = "REACTIVE_TASK_CLEANUP";
pub const CODE_MANUAL_TRIGGER: &str = "MANUAL_TRIGGER";

/// A structured info event: message, code, and scalar/date fields.
#[derive(Debug, Clone)]
pub struct InfoEvent {
    pub code: &'static str,
    pub message: String,
    pub fields: Value,
}

impl InfoEvent {
    pub fn new(code: &'static str, message: impl Into<String>, fields: Value) -> Self {
        Self {
            code,
            message: message.into(),
            fields,
        }
    }
}

impl fmt::Display for InfoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

type ErrorSink = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;
type InfoSink = Arc<dyn Fn(InfoEvent) + Send + Sync>;

/// The pair of observability callbacks threaded through the engine.
#[derive(Clone)]
pub struct Sinks {
    on_error: ErrorSink,
    on_info: InfoSink,
}

impl Sinks {
    pub fn new(on_error: ErrorSink, on_info: InfoSink) -> Self {
        Self { on_error, on_info }
    }

    pub fn error(&self, err: &anyhow::Error) {
        (self.on_error)(err);
    }

    pub fn info(&self, event: InfoEvent) {
        (self.on_info)(event);
    }
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            on_error: Arc::new(|err| tracing::error!(error = %err, "reactive task error")),
            on_info: Arc::new(|event| {
                tracing::info!(code = event.code, fields = %event.fields, "{}", event.message);
            }),
        }
    }
}

impl fmt::Debug for Sinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn custom_sinks_receive_events() {
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let sinks = Sinks::new(
            Arc::new(|_| {}),
            Arc::new(move |event| seen_clone.lock().unwrap().push(event.code)),
        );

        sinks.info(InfoEvent::new(
            CODE_REACTIVE_TASK_STARTED,
            "task started",
            serde_json::json!({"task": "t"}),
        ));

        assert_eq!(*seen.lock().unwrap(), vec![CODE_REACTIVE_TASK_STARTED]);
    }
}
