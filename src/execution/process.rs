//! Script runner backed by an interpreter subprocess.

use std::process::Stdio;

use tracing::debug;

use super::{ScriptError, ScriptOutput, ScriptRequest, ScriptRunner};

/// `EX_TEMPFAIL` from sysexits.h; scripts exit with it when a remote
/// service they depend on misbehaves.
pub const EXIT_REMOTE_FAILURE: i32 = 75;

const UNKNOWN_HOST_MARKERS: &[&str] = &[
    "could not resolve host",
    "name or service not known",
    "unknown host",
    "temporary failure in name resolution",
    "nodename nor servname provided",
];

/// Runs `<interpreter> <args...> <script>`.
///
/// Resolved properties are exported as environment variables, along with
/// `SURI_PREVIOUS`, `SURI_INSTANCE_ID` and `SURI_DASHBOARD_ID`. The child is
/// killed if the returned future is dropped.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    interpreter: String,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(interpreter: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            args,
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new("sh", vec!["-c".to_string()])
    }
}

#[async_trait::async_trait]
impl ScriptRunner for ProcessRunner {
    async fn execute(&self, request: ScriptRequest) -> Result<ScriptOutput, ScriptError> {
        let mut command = tokio::process::Command::new(&self.interpreter);
        command
            .args(&self.args)
            .arg(&request.script)
            .env("SURI_INSTANCE_ID", request.widget_instance_id.to_string())
            .env("SURI_DASHBOARD_ID", request.dashboard_id.to_string())
            .env("SURI_PREVIOUS", request.previous_output.as_deref().unwrap_or_default())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        for (key, value) in &request.properties {
            if let Some(value) = value {
                command.env(key, value);
            }
        }

        debug!(
            interpreter = %self.interpreter,
            widget_instance_id = request.widget_instance_id,
            "spawning widget script"
        );
        let output = command.output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            return Ok(ScriptOutput {
                data: if stdout.is_empty() { None } else { Some(stdout) },
                log: stderr,
            });
        }

        if output.status.code() == Some(EXIT_REMOTE_FAILURE) {
            return Err(ScriptError::Remote { message: stderr });
        }

        if let Some(line) = unknown_host_line(&stderr) {
            return Err(ScriptError::UnknownHost { host: line });
        }

        let message = if stderr.is_empty() {
            format!("script exited with {}", output.status)
        } else {
            stderr
        };
        Err(ScriptError::Script { message })
    }
}

fn unknown_host_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .find(|line| {
            let lower = line.to_lowercase();
            UNKNOWN_HOST_MARKERS.iter().any(|m| lower.contains(m))
        })
        .map(|line| line.trim().to_string())
}
