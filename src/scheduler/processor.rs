//! Turns execution outcomes into persisted state, notifications and the
//! next cycle.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use super::registry::Lease;
use super::ExecutionScheduler;
use crate::execution::{ErrorKind, ExecutionResult, WidgetExecutionService};
use crate::notify::{ExecutionNotifier, WidgetEvent, WidgetEventKind};
use crate::storage::WidgetInstanceStore;
use crate::widget::WidgetState;

#[derive(Clone)]
pub struct ResultProcessor {
    store: Arc<dyn WidgetInstanceStore>,
    service: WidgetExecutionService,
    notifier: Arc<dyn ExecutionNotifier>,
}

impl ResultProcessor {
    pub fn new(
        store: Arc<dyn WidgetInstanceStore>,
        service: WidgetExecutionService,
        notifier: Arc<dyn ExecutionNotifier>,
    ) -> Self {
        Self {
            store,
            service,
            notifier,
        }
    }

    /// Persist one execution outcome, notify subscribers and, unless the
    /// error was fatal, schedule the next cycle from freshly persisted state.
    ///
    /// With a `lease`, the outcome is dropped once the pair that produced it
    /// has been cancelled or superseded.
    pub fn process(
        &self,
        result: &ExecutionResult,
        scheduler: &ExecutionScheduler,
        lease: Option<Lease>,
    ) -> Result<()> {
        let id = result.widget_instance_id;

        match scheduler.while_current(lease, || self.persist(result)) {
            Some(persisted) => persisted?,
            None => {
                debug!(widget_instance_id = id, "pair no longer current, result dropped");
                return Ok(());
            }
        }

        if result.error_kind != ErrorKind::Fatal {
            let descriptor = self.service.build_descriptor(id);
            scheduler.schedule_leased(descriptor, false, lease)?;
        }
        Ok(())
    }

    fn persist(&self, result: &ExecutionResult) -> Result<()> {
        let id = result.widget_instance_id;
        match result.output_data.as_deref().filter(|_| result.valid()) {
            Some(data) => {
                self.store.update_after_success(
                    result.launched_at,
                    result.log.as_deref(),
                    data,
                    id,
                    WidgetState::Running,
                )?;
                debug!(widget_instance_id = id, "execution succeeded");
            }
            None => {
                let state = if result.error_kind == ErrorKind::Fatal {
                    WidgetState::Stopped
                } else {
                    WidgetState::Warning
                };
                self.store
                    .update_after_failure(result.launched_at, result.log.as_deref(), id, state)?;
                info!(
                    widget_instance_id = id,
                    error_kind = ?result.error_kind,
                    %state,
                    "execution failed"
                );
            }
        }
        self.notify(WidgetEventKind::Update, id)
    }

    /// Halt an instance whose execution produced no result. Never
    /// reschedules.
    pub fn process_no_result(
        &self,
        log: &str,
        widget_instance_id: i64,
        dashboard_id: i64,
    ) -> Result<()> {
        self.store.update_after_failure(
            Utc::now(),
            Some(log),
            widget_instance_id,
            WidgetState::Stopped,
        )?;
        info!(widget_instance_id, dashboard_id, %log, "widget stopped without result");
        self.notify(WidgetEventKind::Stopped, widget_instance_id)
    }

    fn notify(&self, kind: WidgetEventKind, id: i64) -> Result<()> {
        match self.store.get_instance(id)? {
            Some(instance) => self
                .notifier
                .notify_widget_instance_subscribers(WidgetEvent::from_instance(kind, &instance)),
            None => debug!(widget_instance_id = id, "instance vanished, nothing to notify"),
        }
        Ok(())
    }
}
