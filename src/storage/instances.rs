//! SQLite-backed widget instance store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{from_sql_time, to_sql_time, Pool, WidgetInstanceStore};
use crate::widget::{
    CategoryParameter, Dashboard, DashboardGrid, Widget, WidgetInstance, WidgetParam, WidgetState,
};

/// Widget instance store over an r2d2 SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn get_dashboard_by_token(&self, token: &str) -> Result<Option<Dashboard>> {
        let conn = self.pool.get()?;
        let head = conn
            .query_row(
                "SELECT id, token, name FROM dashboards WHERE token = ?1",
                params![token],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;

        match head {
            Some((id, token, name)) => Ok(Some(Dashboard {
                id,
                token,
                name,
                grids: load_grids(&conn, id)?,
            })),
            None => Ok(None),
        }
    }

    /// All dashboards with their grids, ordered by id.
    pub fn list_dashboards(&self) -> Result<Vec<Dashboard>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT id, token, name FROM dashboards ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut heads = Vec::new();
        for r in rows {
            heads.push(r?);
        }

        let mut dashboards = Vec::with_capacity(heads.len());
        for (id, token, name) in heads {
            dashboards.push(Dashboard {
                id,
                token,
                name,
                grids: load_grids(&conn, id)?,
            });
        }
        Ok(dashboards)
    }
}

fn load_grids(conn: &Connection, dashboard_id: i64) -> Result<Vec<DashboardGrid>> {
    let mut grid_stmt = conn.prepare("SELECT id FROM grids WHERE dashboard_id = ?1 ORDER BY id")?;
    let grid_ids: Vec<i64> = grid_stmt
        .query_map(params![dashboard_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut instance_stmt =
        conn.prepare("SELECT id FROM widget_instances WHERE grid_id = ?1 ORDER BY id")?;
    let mut grids = Vec::with_capacity(grid_ids.len());
    for id in grid_ids {
        let widget_instance_ids: Vec<i64> = instance_stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        grids.push(DashboardGrid {
            id,
            widget_instance_ids,
        });
    }
    Ok(grids)
}

fn load_widget(conn: &Connection, widget_id: i64) -> Result<Widget> {
    let (id, name, category_id, script, delay_secs, timeout_secs) = conn
        .query_row(
            "SELECT id, name, category_id, script, delay_secs, timeout_secs FROM widgets WHERE id = ?1",
            params![widget_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            },
        )
        .with_context(|| format!("widget {} not found", widget_id))?;

    let mut stmt = conn.prepare(
        "SELECT name, default_value, data_type, required FROM widget_params
         WHERE widget_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)? != 0,
        ))
    })?;
    let mut widget_params = Vec::new();
    for r in rows {
        let (name, default_value, data_type, required) = r?;
        widget_params.push(WidgetParam {
            name,
            default_value,
            data_type: data_type.parse().unwrap_or_default(),
            required,
        });
    }

    let mut category_parameters = Vec::new();
    if let Some(category_id) = category_id {
        let mut stmt = conn.prepare(
            "SELECT key, value, data_type FROM category_parameters
             WHERE category_id = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![category_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        for r in rows {
            let (key, value, data_type) = r?;
            category_parameters.push(CategoryParameter {
                key,
                value,
                data_type: data_type.parse().unwrap_or_default(),
            });
        }
    }

    Ok(Widget {
        id,
        name,
        script,
        delay_secs,
        timeout_secs,
        params: widget_params,
        category_parameters,
    })
}

impl WidgetInstanceStore for SqliteStore {
    fn get_instance(&self, id: i64) -> Result<Option<WidgetInstance>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT wi.id, wi.grid_id, wi.widget_id, wi.configuration, wi.state, wi.log,
                        wi.data, wi.last_execution_at, wi.last_success_at, g.dashboard_id, d.token
                 FROM widget_instances wi
                 JOIN grids g ON g.id = wi.grid_id
                 JOIN dashboards d ON d.id = g.dashboard_id
                 WHERE wi.id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            grid_id,
            widget_id,
            configuration,
            state,
            log,
            data,
            last_execution_at,
            last_success_at,
            dashboard_id,
            dashboard_token,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(WidgetInstance {
            id,
            dashboard_id,
            dashboard_token,
            grid_id,
            widget: load_widget(&conn, widget_id)?,
            configuration,
            state: state.parse().unwrap_or_default(),
            log,
            data,
            last_execution_at: from_sql_time(last_execution_at),
            last_success_at: from_sql_time(last_success_at),
        }))
    }

    fn get_dashboard(&self, id: i64) -> Result<Option<Dashboard>> {
        let conn = self.pool.get()?;
        let head = conn
            .query_row(
                "SELECT token, name FROM dashboards WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match head {
            Some((token, name)) => Ok(Some(Dashboard {
                id,
                token,
                name,
                grids: load_grids(&conn, id)?,
            })),
            None => Ok(None),
        }
    }

    fn update_state(&self, state: WidgetState, id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.pool.get()?;
        match at {
            Some(at) => conn.execute(
                "UPDATE widget_instances SET state = ?1, last_execution_at = ?2,
                 updated_at = datetime('now') WHERE id = ?3",
                params![state.as_str(), to_sql_time(&at), id],
            ),
            None => conn.execute(
                "UPDATE widget_instances SET state = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![state.as_str(), id],
            ),
        }
        .context("Failed to update widget state")?;
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
        let conn = self.pool.get()?;
        let launched_at = to_sql_time(&launched_at);
        conn.execute(
            "UPDATE widget_instances SET state = ?1, log = ?2, data = ?3,
             last_execution_at = ?4, last_success_at = ?4, updated_at = datetime('now')
             WHERE id = ?5",
            params![state.as_str(), log, data, launched_at, id],
        )
        .context("Failed to store widget success")?;
        Ok(())
    }

    fn update_after_failure(
        &self,
        launched_at: DateTime<Utc>,
        log: Option<&str>,
        id: i64,
        state: WidgetState,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE widget_instances SET state = ?1, log = ?2, last_execution_at = ?3,
             updated_at = datetime('now') WHERE id = ?4",
            params![state.as_str(), log, to_sql_time(&launched_at), id],
        )
        .context("Failed to store widget failure")?;
        Ok(())
    }

    fn reset_all_to_stopped(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE widget_instances SET state = ?1, updated_at = datetime('now')",
            params![WidgetState::Stopped.as_str()],
        )?;
        Ok(changed)
    }
}
