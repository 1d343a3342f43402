//! Suricate -- widget execution scheduler for TV dashboards.
//!
//! This crate provides the execution core that periodically runs widget
//! scripts, bounds their runtime, persists outcomes, notifies subscribers
//! and reschedules the next cycle.

pub mod config;
pub mod execution;
pub mod notify;
pub mod scheduler;
pub mod secrets;
pub mod storage;
pub mod widget;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::SuricateConfig;
use crate::execution::process::ProcessRunner;
use crate::notify::{ChannelNotifier, ExecutionNotifier};
use crate::scheduler::ExecutionScheduler;
use crate::secrets::SecretCipher;
use crate::storage::{SqliteStore, WidgetInstanceStore};
use crate::widget::Dashboard;

/// Open (or create) the database at `path`, creating parent directories.
pub fn open_store(path: &Path) -> Result<SqliteStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let pool = storage::open_pool(&path.to_string_lossy())?;
    Ok(SqliteStore::new(pool))
}

/// Wire a scheduler from configuration. The scheduler is not initialized.
pub fn build_scheduler(
    config: &SuricateConfig,
    store: Arc<dyn WidgetInstanceStore>,
    notifier: Arc<dyn ExecutionNotifier>,
) -> Result<ExecutionScheduler> {
    if config.secrets.is_default() {
        warn!("using the default secrets passphrase; set SURICATE_SECRET_PASSPHRASE");
    }
    let cipher = SecretCipher::from_passphrase(&config.secrets.passphrase)
        .context("failed to derive the secrets key")?;
    let runner = ProcessRunner::new(config.runner.interpreter.clone(), config.runner.args.clone());

    Ok(ExecutionScheduler::new(
        config.scheduler.clone(),
        store,
        Arc::new(runner),
        notifier,
        Arc::new(cipher),
    ))
}

/// Every dashboard, or only the one with `token`.
pub fn select_dashboards(store: &SqliteStore, token: Option<&str>) -> Result<Vec<Dashboard>> {
    match token {
        Some(token) => store
            .get_dashboard_by_token(token)?
            .map(|d| vec![d])
            .with_context(|| format!("unknown dashboard '{}'", token)),
        None => store.list_dashboards(),
    }
}

/// Reset the scheduler and queue every widget of the selected dashboards.
pub fn start(
    scheduler: &ExecutionScheduler,
    store: &SqliteStore,
    token: Option<&str>,
) -> Result<Vec<Dashboard>> {
    scheduler.init()?;
    let dashboards = select_dashboards(store, token)?;
    for dashboard in &dashboards {
        let descriptors = scheduler.service().build_descriptors(dashboard);
        info!(
            dashboard = %dashboard.token,
            widgets = descriptors.len(),
            "scheduling dashboard"
        );
        scheduler.schedule_all(descriptors, true);
    }
    Ok(dashboards)
}

/// Run the scheduler daemon until Ctrl-C. SIGHUP reloads every dashboard.
pub async fn serve(config: SuricateConfig, token: Option<String>) -> Result<()> {
    // 1. Storage
    info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let store = open_store(&config.storage.db_path)?;

    // 2. Scheduler
    let (notifier, mut events) = ChannelNotifier::channel();
    let scheduler = build_scheduler(&config, Arc::new(store.clone()), Arc::new(notifier))?;
    let mut dashboards = start(&scheduler, &store, token.as_deref())?;

    // 3. Widget events (stand-in for the websocket fan-out)
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(
                dashboard = %event.dashboard_token,
                widget_instance_id = event.widget_instance_id,
                kind = ?event.kind,
                state = %event.state,
                "widget event"
            );
        }
    });

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Ctrl+C received, stopping widgets");
                break;
            }
            _ = reload => {
                info!("SIGHUP received, reloading dashboards");
                dashboards = start(&scheduler, &store, token.as_deref())?;
            }
        }
    }

    for dashboard in &dashboards {
        if let Err(e) = scheduler.cancel_widgets_execution_by_dashboard(dashboard) {
            warn!(dashboard = %dashboard.token, error = %e, "failed to stop dashboard");
        }
    }
    scheduler.shutdown();
    Ok(())
}
