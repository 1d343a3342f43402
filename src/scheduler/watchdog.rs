//! Watchdog task: bounds an execution and drives its outcome.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use super::registry::Lease;
use super::ExecutionScheduler;
use crate::execution::{ExecutionDescriptor, ExecutionResult};

pub const TIMEOUT_LOG: &str = "execution exceeded timeout";

/// What became of the supervised execution.
#[derive(Debug)]
enum Outcome {
    Finished(ExecutionResult),
    TimedOut,
    Crashed(String),
    Cancelled,
    /// The pools were torn down before the execution could run.
    Shutdown,
}

pub(super) struct Watchdog {
    pub scheduler: ExecutionScheduler,
    pub descriptor: ExecutionDescriptor,
    pub lease: Lease,
    pub delay: Duration,
    pub timeout: Duration,
    pub permits: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

impl Watchdog {
    #[instrument(
        name = "widget_watchdog",
        skip_all,
        fields(
            widget_instance_id = self.descriptor.widget_instance_id,
            generation = self.lease.generation,
        )
    )]
    pub async fn run(
        self,
        execution: JoinHandle<Option<ExecutionResult>>,
        registered: oneshot::Receiver<()>,
    ) {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("watchdog cancelled");
            }
            _ = self.supervise(execution, registered) => {}
        }
        self.scheduler
            .inner
            .registry
            .remove_if_current(self.lease.widget_instance_id, self.lease.generation);
    }

    async fn supervise(
        &self,
        mut execution: JoinHandle<Option<ExecutionResult>>,
        registered: oneshot::Receiver<()>,
    ) {
        if registered.await.is_err() {
            debug!("pair was never registered");
            return;
        }
        tokio::time::sleep(self.delay).await;

        let outcome = match self.permits.clone().acquire_owned().await {
            Ok(_permit) => match tokio::time::timeout(self.timeout, &mut execution).await {
                Ok(Ok(Some(result))) => Outcome::Finished(result),
                Ok(Ok(None)) => Outcome::Shutdown,
                Ok(Err(e)) => match e.try_into_panic() {
                    Ok(payload) => Outcome::Crashed(panic_message(payload)),
                    Err(_) => Outcome::Cancelled,
                },
                Err(_) => {
                    execution.abort();
                    Outcome::TimedOut
                }
            },
            Err(_) => Outcome::Shutdown,
        };

        match outcome {
            Outcome::Finished(result) => self.complete(result).await,
            Outcome::TimedOut => {
                warn!(timeout_secs = self.timeout.as_secs(), "widget execution timed out");
                self.halt(TIMEOUT_LOG);
            }
            Outcome::Crashed(message) => {
                error!(%message, "widget execution crashed");
                self.halt(&message);
            }
            Outcome::Cancelled => debug!("execution was cancelled"),
            Outcome::Shutdown => debug!("pools shut down before execution"),
        }
    }

    /// Persist the result with retries; on exhaustion schedule the same
    /// descriptor again so the widget keeps cycling.
    async fn complete(&self, result: ExecutionResult) {
        let scheduler = &self.scheduler;
        let processor = &scheduler.inner.processor;
        let outcome = scheduler
            .inner
            .retry
            .run("result processing", || {
                processor.process(&result, scheduler, Some(self.lease))
            })
            .await;

        if let Err(e) = outcome {
            error!(error = %e, "result processing exhausted retries, rescheduling");
            self.reschedule();
        }
    }

    fn halt(&self, log: &str) {
        let descriptor = &self.descriptor;
        let processor = &self.scheduler.inner.processor;
        let halted = self.scheduler.while_current(Some(self.lease), || {
            processor.process_no_result(log, descriptor.widget_instance_id, descriptor.dashboard_id)
        });
        match halted {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!(error = %e, "failed to persist stopped state, rescheduling");
                self.reschedule();
            }
            None => debug!("pair no longer current, not halting"),
        }
    }

    fn reschedule(&self) {
        let rescheduled = self
            .scheduler
            .schedule_leased(self.descriptor.clone(), false, Some(self.lease));
        if let Err(e) = rescheduled {
            error!(error = %e, "fallback reschedule failed");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "widget execution panicked".to_string()
    }
}
