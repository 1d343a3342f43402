//! SQLite storage layer -- schema, the widget instance store, catalog helpers.

pub mod catalog;
pub mod instances;
pub mod memory;
pub mod schema;

use anyhow::Result;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::widget::{Dashboard, WidgetInstance, WidgetState};

pub use self::instances::SqliteStore;
pub use self::memory::MemoryStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Persistence contract used by the execution core.
///
/// Every call is expected to be individually transactional. The core holds
/// no locks across calls; concurrent writers to the same row resolve as
/// last-write-wins.
pub trait WidgetInstanceStore: Send + Sync {
    /// Load an instance together with its widget definition and category
    /// parameters.
    fn get_instance(&self, id: i64) -> Result<Option<WidgetInstance>>;

    /// Load a dashboard with the instance ids of every grid.
    fn get_dashboard(&self, id: i64) -> Result<Option<Dashboard>>;

    /// Set the state; when `at` is given it also becomes the last execution
    /// time.
    fn update_state(&self, state: WidgetState, id: i64, at: Option<DateTime<Utc>>) -> Result<()>;

    fn update_after_success(
        &self,
        launched_at: DateTime<Utc>,
        log: Option<&str>,
        data: &str,
        id: i64,
        state: WidgetState,
    ) -> Result<()>;

    fn update_after_failure(
        &self,
        launched_at: DateTime<Utc>,
        log: Option<&str>,
        id: i64,
        state: WidgetState,
    ) -> Result<()>;

    /// Force every instance to `STOPPED`. Returns the number of rows touched.
    fn reset_all_to_stopped(&self) -> Result<usize>;
}

pub(crate) fn to_sql_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn from_sql_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
