//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS category_parameters (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            data_type TEXT NOT NULL DEFAULT 'TEXT',
            category_id INTEGER NOT NULL,
            FOREIGN KEY (category_id) REFERENCES categories(id)
        );

        CREATE TABLE IF NOT EXISTS widgets (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            category_id INTEGER,
            script TEXT,
            delay_secs INTEGER,
            timeout_secs INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (category_id) REFERENCES categories(id)
        );

        CREATE TABLE IF NOT EXISTS widget_params (
            id INTEGER PRIMARY KEY,
            widget_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            default_value TEXT,
            data_type TEXT NOT NULL DEFAULT 'TEXT',
            required INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (widget_id) REFERENCES widgets(id)
        );

        CREATE TABLE IF NOT EXISTS dashboards (
            id INTEGER PRIMARY KEY,
            token TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS grids (
            id INTEGER PRIMARY KEY,
            dashboard_id INTEGER NOT NULL,
            FOREIGN KEY (dashboard_id) REFERENCES dashboards(id)
        );

        CREATE TABLE IF NOT EXISTS widget_instances (
            id INTEGER PRIMARY KEY,
            grid_id INTEGER NOT NULL,
            widget_id INTEGER NOT NULL,
            configuration TEXT,
            state TEXT NOT NULL DEFAULT 'STOPPED',
            log TEXT,
            data TEXT,
            last_execution_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (grid_id) REFERENCES grids(id),
            FOREIGN KEY (widget_id) REFERENCES widgets(id)
        );

        CREATE INDEX IF NOT EXISTS idx_widget_params_widget ON widget_params(widget_id);
        CREATE INDEX IF NOT EXISTS idx_grids_dashboard ON grids(dashboard_id);
        CREATE INDEX IF NOT EXISTS idx_widget_instances_grid ON widget_instances(grid_id);",
    )?;

    // Migration: Add 'last_success_at' to widget_instances if missing
    let has_last_success: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('widget_instances') WHERE name='last_success_at'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_last_success == 0 {
        conn.execute("ALTER TABLE widget_instances ADD COLUMN last_success_at TEXT", [])?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM widget_instances", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM dashboards", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let has_column: i32 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('widget_instances') WHERE name='last_success_at'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(has_column, 1);
    }
}
