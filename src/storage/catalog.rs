//! Insert helpers for widget definitions, dashboards and their placements.
//!
//! Content normally arrives through the dashboard editor; these helpers are
//! what it (and the test suites) use to populate the tables.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::widget::DataType;

pub fn create_category(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute("INSERT INTO categories (name) VALUES (?1)", params![name])
        .context("Failed to insert category")?;
    Ok(conn.last_insert_rowid())
}

/// Insert or replace a category-level global parameter.
pub fn set_category_parameter(
    conn: &Connection,
    category_id: i64,
    key: &str,
    value: &str,
    data_type: DataType,
) -> Result<()> {
    conn.execute(
        "INSERT INTO category_parameters (key, value, data_type, category_id) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value, data_type=excluded.data_type,
         category_id=excluded.category_id",
        params![key, value, data_type.as_str(), category_id],
    )
    .context("Failed to upsert category parameter")?;
    Ok(())
}

pub fn create_widget(
    conn: &Connection,
    name: &str,
    category_id: Option<i64>,
    script: &str,
    delay_secs: Option<i64>,
    timeout_secs: Option<i64>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO widgets (name, category_id, script, delay_secs, timeout_secs)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![name, category_id, script, delay_secs, timeout_secs],
    )
    .context("Failed to insert widget")?;
    Ok(conn.last_insert_rowid())
}

pub fn add_widget_param(
    conn: &Connection,
    widget_id: i64,
    name: &str,
    default_value: Option<&str>,
    data_type: DataType,
    required: bool,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO widget_params (widget_id, name, default_value, data_type, required)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![widget_id, name, default_value, data_type.as_str(), required as i64],
    )
    .context("Failed to insert widget param")?;
    Ok(conn.last_insert_rowid())
}

pub fn create_dashboard(conn: &Connection, token: &str, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO dashboards (token, name) VALUES (?1, ?2)",
        params![token, name],
    )
    .context("Failed to insert dashboard")?;
    Ok(conn.last_insert_rowid())
}

pub fn add_grid(conn: &Connection, dashboard_id: i64) -> Result<i64> {
    conn.execute("INSERT INTO grids (dashboard_id) VALUES (?1)", params![dashboard_id])
        .context("Failed to insert grid")?;
    Ok(conn.last_insert_rowid())
}

/// Place a widget on a grid. New instances start `STOPPED`.
pub fn add_widget_instance(
    conn: &Connection,
    grid_id: i64,
    widget_id: i64,
    configuration: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO widget_instances (grid_id, widget_id, configuration) VALUES (?1, ?2, ?3)",
        params![grid_id, widget_id, configuration],
    )
    .context("Failed to insert widget instance")?;
    Ok(conn.last_insert_rowid())
}
