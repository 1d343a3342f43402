//! In-memory widget instance store for tests and embedded runs.
//!
//! Every write is also recorded as a [`StoreCall`] so callers can assert on
//! the exact sequence of state transitions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::WidgetInstanceStore;
use crate::widget::{Dashboard, WidgetInstance, WidgetState};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    UpdateState { id: i64, state: WidgetState },
    Success { id: i64, state: WidgetState, data: String },
    Failure { id: i64, state: WidgetState, log: Option<String> },
    ResetAll,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    instances: Arc<Mutex<HashMap<i64, WidgetInstance>>>,
    dashboards: Arc<Mutex<HashMap<i64, Dashboard>>>,
    calls: Arc<Mutex<Vec<StoreCall>>>,
    failing_writes: Arc<AtomicUsize>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_instance(&self, instance: WidgetInstance) {
        lock(&self.instances).insert(instance.id, instance);
    }

    pub fn insert_dashboard(&self, dashboard: Dashboard) {
        lock(&self.dashboards).insert(dashboard.id, dashboard);
    }

    pub fn instance(&self, id: i64) -> Option<WidgetInstance> {
        lock(&self.instances).get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.calls).clone()
    }

    /// State updates recorded for one instance, in order.
    pub fn states_of(&self, id: i64) -> Vec<WidgetState> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                StoreCall::UpdateState { id: i, state }
                | StoreCall::Success { id: i, state, .. }
                | StoreCall::Failure { id: i, state, .. }
                    if *i == id =>
                {
                    Some(*state)
                }
                _ => None,
            })
            .collect()
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            anyhow::bail!("injected write failure");
        }
        Ok(())
    }

    fn record(&self, call: StoreCall) {
        lock(&self.calls).push(call);
    }
}

impl WidgetInstanceStore for MemoryStore {
    fn get_instance(&self, id: i64) -> Result<Option<WidgetInstance>> {
        Ok(self.instance(id))
    }

    fn get_dashboard(&self, id: i64) -> Result<Option<Dashboard>> {
        Ok(lock(&self.dashboards).get(&id).cloned())
    }

    fn update_state(&self, state: WidgetState, id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        self.check_write()?;
        if let Some(instance) = lock(&self.instances).get_mut(&id) {
            instance.state = state;
            if at.is_some() {
                instance.last_execution_at = at;
            }
        }
        self.record(StoreCall::UpdateState { id, state });
        Ok(())
    }

    fn update_after_success(
        &self,
        launched_at: DateTime<Utc>,
        log: Option<&str>,
        data: &str,
        id: i64,
        state: WidgetState,
    ) -> Result<()> {
        self.check_write()?;
        if let Some(instance) = lock(&self.instances).get_mut(&id) {
            instance.state = state;
            instance.log = log.map(str::to_string);
            instance.data = Some(data.to_string());
            instance.last_execution_at = Some(launched_at);
            instance.last_success_at = Some(launched_at);
        }
        self.record(StoreCall::Success {
            id,
            state,
            data: data.to_string(),
        });
        Ok(())
    }

    fn update_after_failure(
        &self,
        launched_at: DateTime<Utc>,
        log: Option<&str>,
        id: i64,
        state: WidgetState,
    ) -> Result<()> {
        self.check_write()?;
        if let Some(instance) = lock(&self.instances).get_mut(&id) {
            instance.state = state;
            instance.log = log.map(str::to_string);
            instance.last_execution_at = Some(launched_at);
        }
        self.record(StoreCall::Failure {
            id,
            state,
            log: log.map(str::to_string),
        });
        Ok(())
    }

    fn reset_all_to_stopped(&self) -> Result<usize> {
        self.check_write()?;
        let mut instances = lock(&self.instances);
        for instance in instances.values_mut() {
            instance.state = WidgetState::Stopped;
        }
        let count = instances.len();
        drop(instances);
        self.record(StoreCall::ResetAll);
        Ok(count)
    }
}
