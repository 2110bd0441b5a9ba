//! Parameter schema rows, in the shared table or a legacy per-dataset table.
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use tracing::debug;

use crate::catalog::schema::{DatasetLayout, ParameterRow, PARAMETER_TABLE};
use crate::error::{Error, Result};
use crate::validation::validate_table_name;

const SHARED_COLUMNS: &str = "param_index, param_id, nth_set, nth_dim, param_id_m_param, \
     setpoint, setpoint_local, name_gobal, name, label, unit, dependency, shape, \
     write_cursor, total_size, oid";

// Legacy tables keep their original column spellings.
const LEGACY_COLUMNS: &str = "id - 1, param_id, nth_set, nth_dim, param_id_m_param, \
     setpoint, setpoint_local, name_gobal, name, label, unit, depencies, shape, \
     write_cursor, total_size, oid";

pub struct ParameterStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ParameterStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn insert_parameters(&self, layout: &DatasetLayout, uuid: i64, rows: &[ParameterRow]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_parameters_on(&tx, layout, uuid, rows)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_parameters(&self, layout: &DatasetLayout, uuid: i64) -> Result<Vec<ParameterRow>> {
        let conn = self.get_conn()?;
        get_parameters_on(&conn, layout, uuid)
    }

    pub fn count_parameters(&self, layout: &DatasetLayout, uuid: i64) -> Result<i64> {
        let conn = self.get_conn()?;
        count_parameters_on(&conn, layout, uuid)
    }

    /// Removes every schema row of the dataset (drops a legacy table).
    pub fn delete_parameters(&self, layout: &DatasetLayout, uuid: i64) -> Result<()> {
        let conn = self.get_conn()?;
        delete_parameters_on(&conn, layout, uuid)
    }

    /// Advances one cursor per `(param_index, write_cursor)` pair.
    pub fn update_cursors(&self, layout: &DatasetLayout, uuid: i64, cursors: &[(i64, i64)]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        update_cursors_on(&tx, layout, uuid, cursors)?;
        tx.commit()?;
        Ok(())
    }
}

pub(crate) fn insert_parameters_on(
    conn: &Connection,
    layout: &DatasetLayout,
    uuid: i64,
    rows: &[ParameterRow],
) -> Result<()> {
    match layout {
        DatasetLayout::Shared => {
            let mut stmt = conn.prepare_cached(&format!(
                "INSERT INTO {} (exp_uuid, {}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                PARAMETER_TABLE, SHARED_COLUMNS
            ))?;
            for row in rows {
                stmt.execute(params![
                    uuid,
                    row.param_index,
                    row.param_id,
                    row.nth_set,
                    row.nth_dim,
                    row.param_id_m_param,
                    row.setpoint,
                    row.setpoint_local,
                    row.name_global,
                    row.name,
                    row.label,
                    row.unit,
                    serde_json::to_string(&row.dependency)?,
                    serde_json::to_string(&row.shape)?,
                    row.write_cursor,
                    row.total_size,
                    row.oid,
                ])?;
            }
        }
        DatasetLayout::Legacy { table } => {
            create_legacy_table_on(conn, table)?;
            let mut sorted: Vec<&ParameterRow> = rows.iter().collect();
            sorted.sort_by_key(|r| r.param_index);
            let mut stmt = conn.prepare(&format!(
                "INSERT INTO {} (id, param_id, nth_set, nth_dim, param_id_m_param, setpoint,
                 setpoint_local, name_gobal, name, label, unit, depencies, shape, write_cursor,
                 total_size, oid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                table
            ))?;
            for row in sorted {
                stmt.execute(params![
                    row.param_index + 1,
                    row.param_id,
                    row.nth_set,
                    row.nth_dim,
                    row.param_id_m_param,
                    row.setpoint,
                    row.setpoint_local,
                    row.name_global,
                    row.name,
                    row.label,
                    row.unit,
                    serde_json::to_string(&row.dependency)?,
                    serde_json::to_string(&row.shape)?,
                    row.write_cursor,
                    row.total_size,
                    row.oid,
                ])?;
            }
        }
    }
    debug!("Inserted {} parameter rows for dataset {}", rows.len(), uuid);
    Ok(())
}

pub(crate) fn get_parameters_on(conn: &Connection, layout: &DatasetLayout, uuid: i64) -> Result<Vec<ParameterRow>> {
    let rows = match layout {
        DatasetLayout::Shared => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM {} WHERE exp_uuid = ?1 ORDER BY param_index",
                SHARED_COLUMNS, PARAMETER_TABLE
            ))?;
            let rows = stmt
                .query_map([uuid], row_to_parameter)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        DatasetLayout::Legacy { table } => {
            validate_table_name(table)?;
            if !crate::catalog::migration::table_exists(conn, table)? {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(&format!("SELECT {} FROM {} ORDER BY id", LEGACY_COLUMNS, table))?;
            let rows = stmt
                .query_map([], row_to_parameter)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(rows)
}

pub(crate) fn count_parameters_on(conn: &Connection, layout: &DatasetLayout, uuid: i64) -> Result<i64> {
    match layout {
        DatasetLayout::Shared => Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE exp_uuid = ?1", PARAMETER_TABLE),
            [uuid],
            |row| row.get(0),
        )?),
        DatasetLayout::Legacy { table } => {
            validate_table_name(table)?;
            if !crate::catalog::migration::table_exists(conn, table)? {
                return Ok(0);
            }
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?)
        }
    }
}

pub(crate) fn delete_parameters_on(conn: &Connection, layout: &DatasetLayout, uuid: i64) -> Result<()> {
    match layout {
        DatasetLayout::Shared => {
            conn.execute(
                &format!("DELETE FROM {} WHERE exp_uuid = ?1", PARAMETER_TABLE),
                [uuid],
            )?;
        }
        DatasetLayout::Legacy { table } => {
            validate_table_name(table)?;
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table))?;
        }
    }
    Ok(())
}

pub(crate) fn update_cursors_on(
    conn: &Connection,
    layout: &DatasetLayout,
    uuid: i64,
    cursors: &[(i64, i64)],
) -> Result<()> {
    for (param_index, cursor) in cursors {
        let changed = match layout {
            DatasetLayout::Shared => conn
                .prepare_cached(&format!(
                    "UPDATE {} SET write_cursor = ?3 WHERE exp_uuid = ?1 AND param_index = ?2",
                    PARAMETER_TABLE
                ))?
                .execute(params![uuid, param_index, cursor])?,
            DatasetLayout::Legacy { table } => {
                validate_table_name(table)?;
                conn.prepare_cached(&format!(
                    "UPDATE {} SET write_cursor = ?2 WHERE id = ?1",
                    table
                ))?
                .execute(params![param_index + 1, cursor])?
            }
        };
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "parameter {} of dataset {}",
                param_index, uuid
            )));
        }
    }
    Ok(())
}

pub(crate) fn create_legacy_table_on(conn: &Connection, table: &str) -> Result<()> {
    validate_table_name(table)?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY,
            param_id INTEGER,
            nth_set INTEGER,
            nth_dim INTEGER,
            param_id_m_param INTEGER,
            setpoint INTEGER,
            setpoint_local INTEGER,
            name_gobal TEXT,
            name TEXT NOT NULL,
            label TEXT NOT NULL,
            unit TEXT NOT NULL,
            depencies TEXT,
            shape TEXT,
            write_cursor INTEGER,
            total_size INTEGER,
            oid INTEGER,
            synchronized INTEGER DEFAULT 0,
            sync_location TEXT
        );",
        table
    ))?;
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: Option<String> = row.get(idx)?;
    let text = text.unwrap_or_else(|| "[]".into());
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_parameter(row: &Row) -> rusqlite::Result<ParameterRow> {
    Ok(ParameterRow {
        param_index: row.get(0)?,
        param_id: row.get(1)?,
        nth_set: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
        nth_dim: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
        param_id_m_param: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        setpoint: row.get::<_, Option<bool>>(5)?.unwrap_or(false),
        setpoint_local: row.get::<_, Option<bool>>(6)?.unwrap_or(false),
        name_global: row.get(7)?,
        name: row.get(8)?,
        label: row.get(9)?,
        unit: row.get(10)?,
        dependency: json_column(row, 11)?,
        shape: json_column(row, 12)?,
        write_cursor: row.get::<_, Option<i64>>(13)?.unwrap_or(0),
        total_size: row.get::<_, Option<i64>>(14)?.unwrap_or(0),
        oid: row.get(15)?,
    })
}
