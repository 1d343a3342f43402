use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use suricate::config::{LoggingConfig, SuricateConfig};
use suricate::execution::ErrorKind;
use suricate::notify::NoopNotifier;
use suricate::scheduler::CycleOutcome;
use suricate::storage::WidgetInstanceStore;

#[derive(Parser)]
#[command(
    name = "suricate",
    about = "Widget execution scheduler for TV dashboards",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler daemon for every dashboard (or just one)
    Serve {
        /// Only schedule the dashboard with this token
        #[arg(long)]
        dashboard: Option<String>,
    },

    /// Reset every widget instance to STOPPED
    Reset,

    /// Show the execution state of widget instances
    Status {
        /// Only show the dashboard with this token
        #[arg(long)]
        dashboard: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run one execution cycle for a widget instance now
    Relaunch {
        /// Widget instance id
        #[arg(long)]
        instance: i64,
    },
}

fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

/// Resolve the configuration with a temporary stderr subscriber, so that
/// fallback warnings show up before logging is configured.
fn resolve_config(explicit: Option<&std::path::Path>) -> Result<SuricateConfig> {
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || SuricateConfig::resolve(explicit))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = env_filter(&logging.level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = resolve_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { dashboard } => {
            tracing::info!(dashboard = ?dashboard, "Starting suricate scheduler");
            suricate::serve(config, dashboard).await?;
        }
        Commands::Reset => {
            let store = suricate::open_store(&config.storage.db_path)?;
            let count = store.reset_all_to_stopped()?;
            println!("{} widget instance(s) reset to STOPPED.", count);
        }
        Commands::Status { dashboard, json } => {
            let store = suricate::open_store(&config.storage.db_path)?;
            let dashboards = suricate::select_dashboards(&store, dashboard.as_deref())?;

            let mut rows = Vec::new();
            for d in &dashboards {
                for id in d.widget_instance_ids() {
                    if let Some(instance) = store.get_instance(id)? {
                        rows.push(instance);
                    }
                }
            }

            if json {
                let entries: Vec<_> = rows
                    .iter()
                    .map(|i| {
                        serde_json::json!({
                            "dashboard": i.dashboard_token,
                            "widget_instance_id": i.id,
                            "widget": i.widget.name,
                            "state": i.state,
                            "last_execution_at": i.last_execution_at,
                            "last_success_at": i.last_success_at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if rows.is_empty() {
                println!("No widget instances found.");
            } else {
                println!(
                    "{:<12} | {:<6} | {:<20} | {:<8} | {:<25} | Last success",
                    "Dashboard", "Id", "Widget", "State", "Last execution"
                );
                println!(
                    "{:-<12}-|-{:-<6}-|-{:-<20}-|-{:-<8}-|-{:-<25}-|-{:-<25}",
                    "", "", "", "", "", ""
                );
                for i in &rows {
                    println!(
                        "{:<12} | {:<6} | {:<20} | {:<8} | {:<25} | {}",
                        i.dashboard_token,
                        i.id,
                        i.widget.name,
                        i.state,
                        fmt_time(i.last_execution_at),
                        fmt_time(i.last_success_at),
                    );
                }
            }
        }
        Commands::Relaunch { instance } => {
            let store = suricate::open_store(&config.storage.db_path)?;
            store
                .get_instance(instance)?
                .with_context(|| format!("widget instance {} not found", instance))?;

            let scheduler = suricate::build_scheduler(
                &config,
                Arc::new(store.clone()),
                Arc::new(NoopNotifier),
            )?;
            tracing::info!(widget_instance_id = instance, "Relaunching widget");

            match scheduler.execute_now(instance).await? {
                CycleOutcome::NotExecutable => {
                    println!("Widget instance {} is not executable; it was stopped.", instance)
                }
                CycleOutcome::TimedOut => {
                    println!("Widget instance {} exceeded its timeout; it was stopped.", instance)
                }
                CycleOutcome::Finished(result) => {
                    let verdict = match result.error_kind {
                        ErrorKind::None if result.valid() => "OK",
                        ErrorKind::Recoverable | ErrorKind::None => "WARNING",
                        ErrorKind::Fatal => "FATAL",
                    };
                    println!("\n=== Widget {} ===", instance);
                    println!("Outcome: {}", verdict);
                    if let Some(data) = &result.output_data {
                        println!("Data:    {}", data);
                    }
                    if let Some(log) = &result.log {
                        println!("Log:\n{}", log);
                    }
                }
            }
            if let Some(updated) = store.get_instance(instance)? {
                println!("State:   {}", updated.state);
            }
        }
    }

    Ok(())
}

fn fmt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}
