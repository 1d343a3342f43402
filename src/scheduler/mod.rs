//! Execution scheduler: two bounded pools and the per-instance registry.
//!
//! Every scheduled widget instance gets a pair of tasks started after the
//! same delay. The execution task runs the script; the watchdog waits for it
//! up to the widget timeout and hands the outcome to the
//! [`ResultProcessor`], which schedules the next cycle. Pool sizes are
//! enforced with semaphores, so excess work queues instead of piling up
//! concurrent scripts.

pub mod policy;
pub mod processor;
pub mod registry;
pub mod retry;
mod watchdog;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::execution::{
    ExecutionDescriptor, ExecutionResult, ExecutionTask, ScriptRunner, WidgetExecutionService,
};
use crate::notify::ExecutionNotifier;
use crate::secrets::SecretCipher;
use crate::storage::WidgetInstanceStore;
use crate::widget::{Dashboard, WidgetState};

use self::policy::{DelayKind, DelayPolicy};
use self::registry::{Lease, Registry, RegistryEntry};
use self::retry::RetryPolicy;
use self::watchdog::Watchdog;

pub use self::processor::ResultProcessor;
pub use self::watchdog::TIMEOUT_LOG;

/// Live pools. Replaced wholesale by [`ExecutionScheduler::init`].
#[derive(Clone)]
struct Pools {
    runtime: Handle,
    execution: Arc<Semaphore>,
    watchdog: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Pools {
    fn new(config: &SchedulerConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .context("execution scheduler must be initialized inside a tokio runtime")?;
        Ok(Self {
            runtime,
            execution: Arc::new(Semaphore::new(config.execution_pool_size.max(1))),
            watchdog: Arc::new(Semaphore::new(config.watchdog_pool_size.max(1))),
            shutdown: CancellationToken::new(),
        })
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.execution.close();
        self.watchdog.close();
    }
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn WidgetInstanceStore>,
    service: WidgetExecutionService,
    processor: ResultProcessor,
    runner: Arc<dyn ScriptRunner>,
    cipher: Arc<SecretCipher>,
    policy: DelayPolicy,
    retry: RetryPolicy,
    registry: Registry,
    pools: RwLock<Option<Pools>>,
}

/// Result of [`ExecutionScheduler::execute_now`].
#[derive(Debug)]
pub enum CycleOutcome {
    NotExecutable,
    TimedOut,
    Finished(ExecutionResult),
}

/// Cheaply cloneable handle to the scheduler.
#[derive(Clone)]
pub struct ExecutionScheduler {
    inner: Arc<Inner>,
}

impl ExecutionScheduler {
    /// Wire the scheduler. Nothing runs until [`init`](Self::init) is called.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn WidgetInstanceStore>,
        runner: Arc<dyn ScriptRunner>,
        notifier: Arc<dyn ExecutionNotifier>,
        cipher: Arc<SecretCipher>,
    ) -> Self {
        let service = WidgetExecutionService::new(store.clone(), config.timeout_floor_secs);
        let processor = ResultProcessor::new(store.clone(), service.clone(), notifier);
        let (min_backoff, max_backoff) = config.retry_backoff();
        Self {
            inner: Arc::new(Inner {
                policy: DelayPolicy::new(&config),
                retry: RetryPolicy::new(config.retry_attempts, min_backoff, max_backoff),
                config,
                store,
                service,
                processor,
                runner,
                cipher,
                registry: Registry::new(),
                pools: RwLock::new(None),
            }),
        }
    }

    pub fn service(&self) -> &WidgetExecutionService {
        &self.inner.service
    }

    pub fn processor(&self) -> &ResultProcessor {
        &self.inner.processor
    }

    /// Tear down any running pools, start fresh ones and reset every widget
    /// instance to `STOPPED`. Safe to call repeatedly.
    ///
    /// Everything registered before the call is cancelled before the reset,
    /// and the fresh pools only open afterwards, so no earlier watchdog can
    /// write state or schedule into them.
    pub fn init(&self) -> Result<()> {
        let fresh = Pools::new(&self.inner.config)?;
        self.close_pools();
        let cancelled = self.inner.registry.cancel_all();
        let reset = self.inner.store.reset_all_to_stopped()?;
        *self.inner.pools.write().unwrap_or_else(PoisonError::into_inner) = Some(fresh);

        info!(
            cancelled,
            reset,
            execution_pool = self.inner.config.execution_pool_size,
            watchdog_pool = self.inner.config.watchdog_pool_size,
            "execution scheduler initialized"
        );
        Ok(())
    }

    /// Stop the pools and cancel everything in flight without touching
    /// persisted state. `schedule` is a no-op afterwards until `init`.
    pub fn shutdown(&self) {
        self.close_pools();
        let cancelled = self.inner.registry.cancel_all();
        debug!(cancelled, "execution scheduler shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.pools().is_some()
    }

    /// Schedule every descriptor. A failing descriptor is logged and does
    /// not prevent the others from being scheduled.
    pub fn schedule_all<I>(&self, descriptors: I, immediate: bool)
    where
        I: IntoIterator<Item = ExecutionDescriptor>,
    {
        for descriptor in descriptors {
            let id = descriptor.widget_instance_id;
            if let Err(e) = self.schedule(descriptor, immediate) {
                error!(widget_instance_id = id, error = %e, "failed to schedule widget");
            }
        }
    }

    /// Queue the next execution of one widget instance.
    ///
    /// Non-executable descriptors are persisted `STOPPED` and never queued.
    /// A stopped but executable descriptor is resumed as `RUNNING` first.
    /// Any previous pair for the instance is superseded, not cancelled.
    pub fn schedule(&self, descriptor: ExecutionDescriptor, immediate: bool) -> Result<()> {
        self.schedule_leased(descriptor, immediate, None)
    }

    /// [`schedule`](Self::schedule) on behalf of the pair holding `lease`.
    /// Nothing is persisted or registered once that pair has been cancelled
    /// or superseded.
    fn schedule_leased(
        &self,
        mut descriptor: ExecutionDescriptor,
        immediate: bool,
        lease: Option<Lease>,
    ) -> Result<()> {
        let id = descriptor.widget_instance_id;
        let Some(pools) = self.pools() else {
            debug!(widget_instance_id = id, "scheduler not initialized, ignoring");
            return Ok(());
        };

        if !self.inner.service.is_executable(&descriptor) {
            if let Some(persisted) = self.while_current(lease, || {
                self.inner.store.update_state(WidgetState::Stopped, id, None)
            }) {
                persisted?;
            }
            return Ok(());
        }

        let resumed = descriptor.current_state == WidgetState::Stopped;
        if resumed {
            let persisted = self.while_current(lease, || {
                self.inner.store.update_state(WidgetState::Running, id, None)
            });
            match persisted {
                Some(persisted) => persisted?,
                None => {
                    debug!(widget_instance_id = id, "lease lost, not resuming widget");
                    return Ok(());
                }
            }
            descriptor.current_state = WidgetState::Running;
        }

        let kind = DelayKind::classify(immediate, resumed);
        let delay = self.inner.policy.delay(kind, &descriptor);
        debug!(
            widget_instance_id = id,
            delay_secs = delay.as_secs(),
            ?kind,
            "scheduling widget"
        );
        self.spawn_pair(&pools, descriptor, delay, lease);
        Ok(())
    }

    /// Cancel the current pair of an instance and schedule it again.
    pub fn cancel_and_schedule(&self, descriptor: ExecutionDescriptor) -> Result<()> {
        self.cancel_widget_execution(descriptor.widget_instance_id)?;
        self.schedule(descriptor, false)
    }

    /// Cancel every widget instance placed on the dashboard.
    pub fn cancel_widgets_execution_by_dashboard(&self, dashboard: &Dashboard) -> Result<()> {
        let mut failures = 0usize;
        for id in dashboard.widget_instance_ids() {
            if let Err(e) = self.cancel_widget_execution(id) {
                failures += 1;
                error!(widget_instance_id = id, error = %e, "failed to cancel widget");
            }
        }
        if failures > 0 {
            anyhow::bail!(
                "failed to stop {} widget(s) of dashboard {}",
                failures,
                dashboard.token
            );
        }
        Ok(())
    }

    /// Cancel the in-flight pair of an instance, if any, and persist
    /// `STOPPED`.
    pub fn cancel_widget_execution(&self, widget_instance_id: i64) -> Result<()> {
        if let Some(entry) = self.inner.registry.remove(widget_instance_id) {
            entry.cancel();
            debug!(widget_instance_id, generation = entry.generation, "cancelled widget execution");
        }
        self.inner
            .store
            .update_state(WidgetState::Stopped, widget_instance_id, None)
    }

    /// Run one cycle for an instance right now, outside the pools, and
    /// process its result. The follow-up schedule only happens when the
    /// scheduler is initialized.
    pub async fn execute_now(&self, widget_instance_id: i64) -> Result<CycleOutcome> {
        let descriptor = self.inner.service.build_descriptor(widget_instance_id);
        if !self.inner.service.is_executable(&descriptor) {
            self.inner
                .store
                .update_state(WidgetState::Stopped, widget_instance_id, None)?;
            return Ok(CycleOutcome::NotExecutable);
        }

        let dashboard_id = descriptor.dashboard_id;
        let timeout = descriptor.effective_timeout(self.inner.config.timeout_floor_secs);
        let task = ExecutionTask::new(
            descriptor,
            self.inner.runner.clone(),
            self.inner.cipher.clone(),
        );
        match tokio::time::timeout(timeout, task.run()).await {
            Ok(result) => {
                self.inner.processor.process(&result, self, None)?;
                Ok(CycleOutcome::Finished(result))
            }
            Err(_) => {
                self.inner
                    .processor
                    .process_no_result(TIMEOUT_LOG, widget_instance_id, dashboard_id)?;
                Ok(CycleOutcome::TimedOut)
            }
        }
    }

    pub fn has_entry(&self, widget_instance_id: i64) -> bool {
        self.inner.registry.contains(widget_instance_id)
    }

    pub fn entry_generation(&self, widget_instance_id: i64) -> Option<u64> {
        self.inner.registry.generation_of(widget_instance_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Run `f` unless `lease` has been cancelled or superseded. Callers
    /// without a lease own no registry entry and always run.
    fn while_current<T>(&self, lease: Option<Lease>, f: impl FnOnce() -> T) -> Option<T> {
        match lease {
            Some(lease) => self.inner.registry.while_current(lease, f),
            None => Some(f()),
        }
    }

    fn close_pools(&self) {
        let previous = self
            .inner
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.close();
        }
    }

    fn pools(&self) -> Option<Pools> {
        self.inner
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn spawn_pair(
        &self,
        pools: &Pools,
        descriptor: ExecutionDescriptor,
        delay: Duration,
        lease: Option<Lease>,
    ) {
        let id = descriptor.widget_instance_id;
        let generation = self.inner.registry.next_generation();
        let cancel = pools.shutdown.child_token();
        let timeout = descriptor.effective_timeout(self.inner.config.timeout_floor_secs);

        let task = ExecutionTask::new(
            descriptor.clone(),
            self.inner.runner.clone(),
            self.inner.cipher.clone(),
        );
        let permits = pools.execution.clone();
        let exec_cancel = cancel.clone();
        let execution = pools.runtime.spawn(async move {
            tokio::select! {
                _ = exec_cancel.cancelled() => None,
                result = async {
                    tokio::time::sleep(delay).await;
                    let _permit = permits.acquire_owned().await.ok()?;
                    Some(task.run().await)
                } => result,
            }
        });
        let execution_abort = execution.abort_handle();

        let (registered_tx, registered) = oneshot::channel();
        let watchdog = Watchdog {
            scheduler: self.clone(),
            descriptor,
            lease: Lease { widget_instance_id: id, generation },
            delay,
            timeout,
            permits: pools.watchdog.clone(),
            cancel: cancel.clone(),
        };
        let watchdog = pools.runtime.spawn(watchdog.run(execution, registered));

        let entry = RegistryEntry {
            generation,
            cancel,
            execution: execution_abort,
            watchdog: watchdog.abort_handle(),
        };
        let outcome = match lease {
            Some(lease) => self.inner.registry.hand_over(lease, entry),
            None => self.inner.registry.insert(id, entry),
        };
        match outcome {
            Ok(()) => {
                let _ = registered_tx.send(());
            }
            Err(rejected) => {
                debug!(widget_instance_id = id, generation, "pair superseded before registration");
                rejected.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ScriptError, ScriptOutput, ScriptRequest};
    use crate::notify::{ChannelNotifier, WidgetEvent, WidgetEventKind};
    use crate::storage::memory::StoreCall;
    use crate::storage::MemoryStore;
    use crate::widget::{DashboardGrid, Widget, WidgetInstance};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Data(&'static str),
        Hang,
        Panic,
    }

    struct FakeRunner {
        behaviour: Behaviour,
        calls: AtomicUsize,
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl ScriptRunner for FakeRunner {
        async fn execute(&self, _request: ScriptRequest) -> Result<ScriptOutput, ScriptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Data(data) => Ok(ScriptOutput {
                    data: Some(data.to_string()),
                    log: String::new(),
                }),
                Behaviour::Hang => {
                    let _flag = DropFlag(self.dropped.clone());
                    std::future::pending().await
                }
                Behaviour::Panic => panic!("interpreter crashed"),
            }
        }
    }

    struct Fixture {
        store: MemoryStore,
        scheduler: ExecutionScheduler,
        runner: Arc<FakeRunner>,
        events: UnboundedReceiver<WidgetEvent>,
    }

    fn instance(id: i64, script: &str) -> WidgetInstance {
        WidgetInstance {
            id,
            dashboard_id: 1,
            dashboard_token: "tv".into(),
            widget: Widget {
                script: Some(script.into()),
                delay_secs: Some(30),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fake_runner(behaviour: Behaviour) -> Arc<FakeRunner> {
        Arc::new(FakeRunner {
            behaviour,
            calls: AtomicUsize::new(0),
            dropped: Arc::new(AtomicBool::new(false)),
        })
    }

    fn fixture_with(behaviour: Behaviour, config: SchedulerConfig) -> Fixture {
        let store = MemoryStore::new();
        store.insert_instance(instance(1, "fetch"));
        store.insert_instance(instance(2, "fetch"));
        let runner = fake_runner(behaviour);
        let (notifier, events) = ChannelNotifier::channel();
        let scheduler = ExecutionScheduler::new(
            config,
            Arc::new(store.clone()),
            runner.clone(),
            Arc::new(notifier),
            Arc::new(SecretCipher::from_passphrase("test").unwrap()),
        );
        Fixture {
            store,
            scheduler,
            runner,
            events,
        }
    }

    fn fixture(behaviour: Behaviour) -> Fixture {
        fixture_with(behaviour, SchedulerConfig::default())
    }

    fn descriptor(f: &Fixture, id: i64) -> ExecutionDescriptor {
        f.scheduler.service().build_descriptor(id)
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test]
    async fn test_schedule_before_init_is_noop() {
        let f = fixture(Behaviour::Data("{}"));
        f.scheduler.schedule(descriptor(&f, 1), true).unwrap();
        assert!(!f.scheduler.is_initialized());
        assert!(!f.scheduler.has_entry(1));
        assert!(f.store.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_executable_descriptor_is_stopped_without_tasks() {
        let f = fixture(Behaviour::Data("{}"));
        f.scheduler.init().unwrap();

        let blank = ExecutionDescriptor { script: Some(String::new()), ..descriptor(&f, 1) };
        f.scheduler.schedule(blank, false).unwrap();
        let negative = ExecutionDescriptor { delay_secs: Some(-5), ..descriptor(&f, 2) };
        f.scheduler.schedule(negative, true).unwrap();

        assert_eq!(f.store.states_of(1), vec![WidgetState::Stopped]);
        assert_eq!(f.store.states_of(2), vec![WidgetState::Stopped]);
        assert_eq!(f.scheduler.active_count(), 0);
        advance(5).await;
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_descriptor_is_resumed_as_running() {
        let f = fixture(Behaviour::Hang);
        f.scheduler.init().unwrap();

        let d = ExecutionDescriptor { delay_secs: Some(15), ..descriptor(&f, 1) };
        assert_eq!(d.current_state, WidgetState::Stopped);
        f.scheduler.schedule(d, false).unwrap();

        assert_eq!(f.store.states_of(1), vec![WidgetState::Running]);
        assert!(f.scheduler.has_entry(1));
        f.scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_entry_only_persists_stopped() {
        let f = fixture(Behaviour::Data("{}"));
        f.scheduler.init().unwrap();

        f.scheduler.cancel_widget_execution(9).unwrap();
        assert_eq!(
            f.store.calls(),
            vec![
                StoreCall::ResetAll,
                StoreCall::UpdateState { id: 9, state: WidgetState::Stopped }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_clears_registry_and_resets_states() {
        let f = fixture(Behaviour::Hang);
        f.scheduler.init().unwrap();
        f.scheduler.schedule_all(vec![descriptor(&f, 1), descriptor(&f, 2)], true);
        assert_eq!(f.scheduler.active_count(), 2);
        advance(2).await;
        assert_eq!(f.store.instance(1).unwrap().state, WidgetState::Running);

        f.scheduler.init().unwrap();
        assert_eq!(f.scheduler.active_count(), 0);
        assert_eq!(f.store.instance(1).unwrap().state, WidgetState::Stopped);
        assert_eq!(f.store.instance(2).unwrap().state, WidgetState::Stopped);

        advance(1).await;
        assert!(f.runner.dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_schedule_supersedes_first_entry() {
        let f = fixture(Behaviour::Hang);
        f.scheduler.init().unwrap();

        f.scheduler.schedule(descriptor(&f, 1), false).unwrap();
        let first = f.scheduler.entry_generation(1).unwrap();
        f.scheduler.schedule(descriptor(&f, 1), false).unwrap();
        let second = f.scheduler.entry_generation(1).unwrap();

        assert!(second > first);
        assert_eq!(f.scheduler.active_count(), 1);
        f.scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_schedule_cancels_old_pair() {
        let f = fixture(Behaviour::Hang);
        f.scheduler.init().unwrap();
        f.scheduler.schedule(descriptor(&f, 1), true).unwrap();
        let first = f.scheduler.entry_generation(1).unwrap();

        advance(2).await;
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 1);
        assert!(!f.runner.dropped.load(Ordering::SeqCst));

        f.scheduler.cancel_and_schedule(descriptor(&f, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(f.runner.dropped.load(Ordering::SeqCst));
        let second = f.scheduler.entry_generation(1).unwrap();
        assert!(second > first);
        assert_eq!(f.scheduler.service().checks(), 2);
        // The descriptor was built while RUNNING, so the reschedule does
        // not resume it; the next result restores the state.
        assert_eq!(f.store.states_of(1), vec![WidgetState::Running, WidgetState::Stopped]);
        f.scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_dashboard_stops_each_instance_once() {
        let f = fixture(Behaviour::Hang);
        f.scheduler.init().unwrap();
        f.scheduler.schedule_all(vec![descriptor(&f, 1), descriptor(&f, 2)], true);
        let dashboard = Dashboard {
            id: 1,
            token: "tv".into(),
            name: "TV".into(),
            grids: vec![
                DashboardGrid { id: 1, widget_instance_ids: vec![1] },
                DashboardGrid { id: 2, widget_instance_ids: vec![2] },
            ],
        };
        let before = f.store.calls().len();

        f.scheduler.cancel_widgets_execution_by_dashboard(&dashboard).unwrap();

        let after = f.store.calls().split_off(before);
        assert_eq!(
            after,
            vec![
                StoreCall::UpdateState { id: 1, state: WidgetState::Stopped },
                StoreCall::UpdateState { id: 2, state: WidgetState::Stopped },
            ]
        );
        assert_eq!(f.scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_cycle_persists_and_reschedules() {
        let mut f = fixture(Behaviour::Data(r#"{"n":1}"#));
        f.scheduler.init().unwrap();
        f.scheduler.schedule(descriptor(&f, 1), true).unwrap();
        let first = f.scheduler.entry_generation(1).unwrap();

        advance(2).await;

        let instance = f.store.instance(1).unwrap();
        assert_eq!(instance.state, WidgetState::Running);
        assert_eq!(instance.data.as_deref(), Some(r#"{"n":1}"#));
        let event = f.events.try_recv().unwrap();
        assert_eq!(event.kind, WidgetEventKind::Update);
        assert_eq!(event.dashboard_token, "tv");
        assert!(f.scheduler.entry_generation(1).unwrap() > first);

        // Next cycle uses the widget delay
        advance(30).await;
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 2);
        f.scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_widget_and_kills_execution() {
        let mut f = fixture(Behaviour::Hang);
        f.scheduler.init().unwrap();
        f.scheduler.schedule(descriptor(&f, 1), true).unwrap();

        advance(70).await;

        let instance = f.store.instance(1).unwrap();
        assert_eq!(instance.state, WidgetState::Stopped);
        assert_eq!(instance.log.as_deref(), Some(TIMEOUT_LOG));
        assert_eq!(f.events.try_recv().unwrap().kind, WidgetEventKind::Stopped);
        assert!(f.runner.dropped.load(Ordering::SeqCst));
        assert!(!f.scheduler.has_entry(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_execution_stops_with_message() {
        let f = fixture(Behaviour::Panic);
        f.scheduler.init().unwrap();
        f.scheduler.schedule(descriptor(&f, 1), true).unwrap();

        advance(2).await;

        let instance = f.store.instance(1).unwrap();
        assert_eq!(instance.state, WidgetState::Stopped);
        assert_eq!(instance.log.as_deref(), Some("interpreter crashed"));
        assert!(!f.scheduler.has_entry(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_failures_are_retried() {
        let f = fixture(Behaviour::Data(r#"{"ok":true}"#));
        f.scheduler.init().unwrap();
        f.scheduler.schedule(descriptor(&f, 1), true).unwrap();
        f.store.fail_next_writes(2);

        advance(25).await;

        let instance = f.store.instance(1).unwrap();
        assert_eq!(instance.data.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(instance.state, WidgetState::Running);
        f.scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fall_back_to_reschedule() {
        let config = SchedulerConfig { retry_attempts: 2, ..SchedulerConfig::default() };
        let f = fixture_with(Behaviour::Data("{}"), config);
        f.scheduler.init().unwrap();
        f.scheduler.schedule(descriptor(&f, 1), true).unwrap();
        let first = f.scheduler.entry_generation(1).unwrap();
        f.store.fail_next_writes(2);

        advance(12).await;

        assert!(!f
            .store
            .calls()
            .iter()
            .any(|c| matches!(c, StoreCall::Success { .. })));
        assert!(f.scheduler.entry_generation(1).unwrap() > first);
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 1);
        f.scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_now_runs_single_cycle() {
        let mut f = fixture(Behaviour::Data(r#"{"now":1}"#));

        let outcome = f.scheduler.execute_now(1).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Finished(ref r) if r.valid()));
        assert_eq!(f.store.instance(1).unwrap().state, WidgetState::Running);
        assert_eq!(f.events.try_recv().unwrap().kind, WidgetEventKind::Update);
        // Not initialized: the follow-up schedule is skipped
        assert!(!f.scheduler.has_entry(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stop_after_timeout_reschedules() {
        let f = fixture(Behaviour::Hang);
        f.scheduler.init().unwrap();
        f.scheduler.schedule(descriptor(&f, 1), true).unwrap();
        let first = f.scheduler.entry_generation(1).unwrap();

        advance(2).await;
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 1);
        f.store.fail_next_writes(1);
        advance(60).await;

        assert!(f.runner.dropped.load(Ordering::SeqCst));
        assert!(f.scheduler.entry_generation(1).unwrap() > first);
        assert_ne!(f.store.instance(1).unwrap().log.as_deref(), Some(TIMEOUT_LOG));

        advance(30).await;
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 2);
        f.scheduler.shutdown();
    }

    /// Memory store whose first success write parks until released.
    struct GateStore {
        inner: MemoryStore,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl WidgetInstanceStore for GateStore {
        fn get_instance(&self, id: i64) -> Result<Option<WidgetInstance>> {
            self.inner.get_instance(id)
        }

        fn get_dashboard(&self, id: i64) -> Result<Option<Dashboard>> {
            self.inner.get_dashboard(id)
        }

        fn update_state(
            &self,
            state: WidgetState,
            id: i64,
            at: Option<DateTime<Utc>>,
        ) -> Result<()> {
            self.inner.update_state(state, id, at)
        }

        fn update_after_success(
            &self,
            launched_at: DateTime<Utc>,
            log: Option<&str>,
            data: &str,
            id: i64,
            state: WidgetState,
        ) -> Result<()> {
            let entered = self.entered.lock().unwrap().take();
            if let Some(entered) = entered {
                entered.send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            self.inner.update_after_success(launched_at, log, data, id, state)
        }

        fn update_after_failure(
            &self,
            launched_at: DateTime<Utc>,
            log: Option<&str>,
            id: i64,
            state: WidgetState,
        ) -> Result<()> {
            self.inner.update_after_failure(launched_at, log, id, state)
        }

        fn reset_all_to_stopped(&self) -> Result<usize> {
            self.inner.reset_all_to_stopped()
        }
    }

    struct Gated {
        memory: MemoryStore,
        scheduler: ExecutionScheduler,
        runner: Arc<FakeRunner>,
        release: mpsc::Sender<()>,
    }

    /// Schedule instance 1 and return once its watchdog is parked inside
    /// the success write.
    async fn gated_cycle() -> Gated {
        let memory = MemoryStore::new();
        memory.insert_instance(instance(1, "fetch"));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        let store = Arc::new(GateStore {
            inner: memory.clone(),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        });
        let runner = fake_runner(Behaviour::Data("{}"));
        let (notifier, _events) = ChannelNotifier::channel();
        let config = SchedulerConfig { immediate_delay_secs: 0, ..SchedulerConfig::default() };
        let scheduler = ExecutionScheduler::new(
            config,
            store,
            runner.clone(),
            Arc::new(notifier),
            Arc::new(SecretCipher::from_passphrase("test").unwrap()),
        );
        scheduler.init().unwrap();
        let d = scheduler.service().build_descriptor(1);
        scheduler.schedule(d, true).unwrap();

        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .unwrap()
            .unwrap();
        Gated {
            memory,
            scheduler,
            runner,
            release,
        }
    }

    /// Run `op` on its own thread while the watchdog is parked, then let the
    /// write through.
    async fn race_with_parked_write<F>(g: &Gated, op: F)
    where
        F: FnOnce(ExecutionScheduler) -> Result<()> + Send + 'static,
    {
        let scheduler = g.scheduler.clone();
        let runtime = Handle::current();
        let racer = std::thread::spawn(move || {
            let _context = runtime.enter();
            op(scheduler)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        g.release.send(()).unwrap();
        tokio::task::spawn_blocking(move || racer.join())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_result_write_keeps_widget_stopped() {
        let g = gated_cycle().await;

        race_with_parked_write(&g, |s| s.cancel_widget_execution(1)).await;

        assert_eq!(g.memory.instance(1).unwrap().state, WidgetState::Stopped);
        assert!(!g.scheduler.has_entry(1));
        assert_eq!(g.memory.states_of(1).last(), Some(&WidgetState::Stopped));
        assert_eq!(g.runner.calls.load(Ordering::SeqCst), 1);
        g.scheduler.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_init_during_result_write_leaves_no_stale_chain() {
        let g = gated_cycle().await;

        race_with_parked_write(&g, |s| s.init()).await;

        assert!(g.scheduler.is_initialized());
        assert_eq!(g.scheduler.active_count(), 0);
        assert_eq!(g.memory.instance(1).unwrap().state, WidgetState::Stopped);
        assert_eq!(g.runner.calls.load(Ordering::SeqCst), 1);
        g.scheduler.shutdown();
    }
}
