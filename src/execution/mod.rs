//! Widget execution: descriptors, results, and the script runner port.
//!
//! A descriptor is rebuilt from persisted state before every cycle; the
//! execution task turns it into an [`ExecutionResult`] by calling the
//! [`ScriptRunner`].

pub mod process;
pub mod service;
pub mod task;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::secrets::SecretError;
use crate::widget::{is_structured, WidgetParam, WidgetState};

pub use self::service::WidgetExecutionService;
pub use self::task::{is_fatal_error, ExecutionTask};

/// Lower bound applied to every widget timeout.
pub const DEFAULT_TIMEOUT_FLOOR_SECS: u64 = 60;

/// Everything needed to run one execution cycle for a widget instance.
#[derive(Debug, Clone, Default)]
pub struct ExecutionDescriptor {
    pub widget_instance_id: i64,
    pub dashboard_id: i64,
    pub dashboard_token: String,
    pub script: Option<String>,
    /// Instance configuration overlaid with category parameters.
    pub merged_config: String,
    /// Last successful output, handed back to the script as context.
    pub previous_output: Option<String>,
    pub delay_secs: Option<i64>,
    pub timeout_secs: u64,
    pub current_state: WidgetState,
    pub last_success_at: Option<DateTime<Utc>>,
    pub params: Vec<WidgetParam>,
}

impl ExecutionDescriptor {
    /// A widget that has produced data at least once gets lenient error
    /// classification.
    pub fn already_success(&self) -> bool {
        self.last_success_at.is_some()
    }

    /// Effective timeout, never below `floor_secs`.
    pub fn effective_timeout(&self, floor_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.max(floor_secs))
    }
}

/// Outcome classification of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorKind {
    #[default]
    None,
    /// Keeps the widget cycling in `WARNING`.
    Recoverable,
    /// Halts the widget in `STOPPED` until someone relaunches it.
    Fatal,
}

/// Result of a single execution, produced by the execution task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub widget_instance_id: i64,
    pub dashboard_id: i64,
    pub dashboard_token: String,
    pub launched_at: DateTime<Utc>,
    pub output_data: Option<String>,
    /// Script trace with secret values already redacted.
    pub log: Option<String>,
    pub error_kind: ErrorKind,
}

impl ExecutionResult {
    pub fn valid(&self) -> bool {
        self.error_kind == ErrorKind::None
            && self.output_data.as_deref().is_some_and(is_structured)
    }
}

/// Input handed to a [`ScriptRunner`].
#[derive(Debug, Clone, Default)]
pub struct ScriptRequest {
    pub script: String,
    /// Resolved parameters; optional parameters without a value map to `None`.
    pub properties: BTreeMap<String, Option<String>>,
    pub previous_output: Option<String>,
    pub widget_instance_id: i64,
    pub dashboard_id: i64,
}

/// Raw script output before validation.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub data: Option<String>,
    pub log: String,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    /// A remote service the script talks to answered with an error.
    #[error("remote service error: {message}")]
    Remote { message: String },

    #[error("unknown host: {host}")]
    UnknownHost { host: String },

    #[error("{message}")]
    Script { message: String },

    #[error("secret parameter '{name}' could not be decrypted")]
    Secret {
        name: String,
        #[source]
        source: SecretError,
    },

    #[error("failed to run interpreter: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes a widget script in an isolated interpreter.
///
/// Implementations are not expected to enforce timeouts themselves: the
/// watchdog bounds the wait and cancels the future, so any resources the
/// runner holds must be released on drop.
#[async_trait::async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn execute(&self, request: ScriptRequest) -> Result<ScriptOutput, ScriptError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(kind: ErrorKind, data: Option<&str>) -> ExecutionResult {
        ExecutionResult {
            widget_instance_id: 1,
            dashboard_id: 1,
            dashboard_token: "t".into(),
            launched_at: Utc::now(),
            output_data: data.map(str::to_string),
            log: None,
            error_kind: kind,
        }
    }

    #[test]
    fn test_valid_requires_structured_data_and_no_error() {
        assert!(result(ErrorKind::None, Some(r#"{"a":1}"#)).valid());
        assert!(!result(ErrorKind::None, Some("plain text")).valid());
        assert!(!result(ErrorKind::None, None).valid());
        assert!(!result(ErrorKind::Recoverable, Some(r#"{"a":1}"#)).valid());
    }

    #[test]
    fn test_effective_timeout_has_floor() {
        let mut descriptor = ExecutionDescriptor { timeout_secs: 5, ..Default::default() };
        assert_eq!(descriptor.effective_timeout(60), Duration::from_secs(60));
        descriptor.timeout_secs = 300;
        assert_eq!(descriptor.effective_timeout(60), Duration::from_secs(300));
    }
}
