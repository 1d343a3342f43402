//! Execution task body: one script run for one widget instance.
//!
//! The task never fails. Every fault ends up classified in the returned
//! [`ExecutionResult`].

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use super::{
    ErrorKind, ExecutionDescriptor, ExecutionResult, ScriptError, ScriptRequest, ScriptRunner,
};
use crate::secrets::SecretCipher;
use crate::widget::{is_structured, parse_properties};

const REDACTED: &str = "****";

pub struct ExecutionTask {
    descriptor: ExecutionDescriptor,
    runner: Arc<dyn ScriptRunner>,
    cipher: Arc<SecretCipher>,
}

impl ExecutionTask {
    pub fn new(
        descriptor: ExecutionDescriptor,
        runner: Arc<dyn ScriptRunner>,
        cipher: Arc<SecretCipher>,
    ) -> Self {
        Self {
            descriptor,
            runner,
            cipher,
        }
    }

    #[instrument(
        name = "widget_execute",
        skip(self),
        fields(
            widget_instance_id = self.descriptor.widget_instance_id,
            dashboard_id = self.descriptor.dashboard_id,
        )
    )]
    pub async fn run(self) -> ExecutionResult {
        let descriptor = &self.descriptor;
        let already_success = descriptor.already_success();
        let mut result = ExecutionResult {
            widget_instance_id: descriptor.widget_instance_id,
            dashboard_id: descriptor.dashboard_id,
            dashboard_token: descriptor.dashboard_token.clone(),
            launched_at: Utc::now(),
            output_data: None,
            log: None,
            error_kind: ErrorKind::None,
        };

        let (properties, secrets) = match resolve_properties(descriptor, &self.cipher) {
            Ok(resolved) => resolved,
            Err(e) => {
                result.log = Some(describe(&e));
                result.error_kind = classify(&e, already_success);
                return result;
            }
        };

        let request = ScriptRequest {
            script: descriptor.script.clone().unwrap_or_default(),
            properties,
            previous_output: descriptor.previous_output.clone(),
            widget_instance_id: descriptor.widget_instance_id,
            dashboard_id: descriptor.dashboard_id,
        };

        match self.runner.execute(request).await {
            Ok(output) => {
                let log = redact(output.log.trim(), &secrets);
                match output.data {
                    Some(data) if is_structured(&data) => {
                        result.output_data = Some(data);
                        result.log = non_empty(log);
                    }
                    _ => {
                        debug!("script returned no structured data");
                        let mut log = log;
                        if !log.is_empty() {
                            log.push('\n');
                        }
                        log.push_str("The widget execution returned invalid data");
                        result.log = Some(log);
                        result.error_kind = if already_success {
                            ErrorKind::Recoverable
                        } else {
                            ErrorKind::Fatal
                        };
                    }
                }
            }
            Err(e) => {
                result.log = Some(redact(&describe(&e), &secrets));
                result.error_kind = classify(&e, already_success);
            }
        }

        debug!(error_kind = ?result.error_kind, "execution finished");
        result
    }
}

fn classify(error: &ScriptError, already_success: bool) -> ErrorKind {
    if is_fatal_error(error, already_success) {
        ErrorKind::Fatal
    } else {
        ErrorKind::Recoverable
    }
}

/// Decide whether a script fault should halt the widget.
///
/// Remote service errors, timeouts and DNS failures are transient. A widget
/// that has succeeded before is always given the benefit of the doubt.
pub fn is_fatal_error(error: &(dyn StdError + 'static), already_success: bool) -> bool {
    let chain: Vec<&(dyn StdError + 'static)> =
        std::iter::successors(Some(error), |e: &&(dyn StdError + 'static)| (*e).source())
            .collect();
    let root = chain.last().copied().unwrap_or(error);

    let is_remote = chain
        .iter()
        .any(|e| matches!(e.downcast_ref::<ScriptError>(), Some(ScriptError::Remote { .. })));
    if is_remote {
        return false;
    }

    if error.to_string().to_lowercase().contains("timeout")
        || root.to_string().to_lowercase().contains("timeout")
    {
        return false;
    }

    let is_unknown_host = chain
        .iter()
        .any(|e| matches!(e.downcast_ref::<ScriptError>(), Some(ScriptError::UnknownHost { .. })));
    if is_unknown_host {
        return false;
    }

    !already_success
}

/// Resolve parameter values for the script.
///
/// Supplied values win; missing required parameters fall back to their
/// default and missing optional ones are passed as `None`. Secret values are
/// decrypted and returned separately so they can be redacted from logs.
fn resolve_properties(
    descriptor: &ExecutionDescriptor,
    cipher: &SecretCipher,
) -> Result<(BTreeMap<String, Option<String>>, Vec<String>), ScriptError> {
    let supplied = parse_properties(&descriptor.merged_config);
    let mut properties: BTreeMap<String, Option<String>> = supplied
        .iter()
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect();
    let mut secrets = Vec::new();

    for param in &descriptor.params {
        let value = match supplied.get(&param.name).filter(|v| !v.is_empty()) {
            Some(encrypted) if param.data_type.is_secret() => {
                let plain = cipher
                    .decrypt(encrypted)
                    .map_err(|source| ScriptError::Secret {
                        name: param.name.clone(),
                        source,
                    })?;
                secrets.push(plain.clone());
                Some(plain)
            }
            Some(value) => Some(value.clone()),
            None if param.required => param.default_value.clone(),
            None => None,
        };
        properties.insert(param.name.clone(), value);
    }

    Ok((properties, secrets))
}

fn redact(log: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(log.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
}

fn describe(error: &ScriptError) -> String {
    let first: &(dyn StdError + 'static) = error;
    let root = std::iter::successors(Some(first), |e: &&(dyn StdError + 'static)| (*e).source())
        .last()
        .map(|e| e.to_string())
        .unwrap_or_default();
    let top = error.to_string();
    if root.is_empty() || root == top {
        top
    } else {
        format!("{} (caused by: {})", top, root)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
