//! Storage for small named calibration records (virtual-gate matrices and
//! channel ratios). Each list column holds JSON bytes.
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::catalog::schema::{MatrixRecord, RatioRecord, MATRIX_TABLE, RATIO_TABLE};
use crate::error::Result;

pub struct MatrixStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl MatrixStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn load_matrix(&self, name: &str) -> Result<Option<MatrixRecord>> {
        let conn = self.get_conn()?;
        let raw: Option<(Vec<u8>, Vec<u8>, Vec<u8>)> = conn
            .query_row(
                &format!(
                    "SELECT real_gates, virtual_gates, matrix FROM {} WHERE name = ?1",
                    MATRIX_TABLE
                ),
                [name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match raw {
            Some((real, virt, matrix)) => Ok(Some(MatrixRecord {
                name: name.to_string(),
                real_names: serde_json::from_slice(&real)?,
                virtual_names: serde_json::from_slice(&virt)?,
                matrix: serde_json::from_slice(&matrix)?,
            })),
            None => Ok(None),
        }
    }

    /// Insert or overwrite; last writer wins.
    pub fn save_matrix(&self, record: &MatrixRecord) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (name, real_gates, virtual_gates, matrix, last_update)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET real_gates = excluded.real_gates,
                 virtual_gates = excluded.virtual_gates, matrix = excluded.matrix,
                 last_update = excluded.last_update",
                MATRIX_TABLE
            ),
            params![
                record.name,
                serde_json::to_vec(&record.real_names)?,
                serde_json::to_vec(&record.virtual_names)?,
                serde_json::to_vec(&record.matrix)?,
                now_seconds(),
            ],
        )?;
        debug!("Saved derived matrix '{}' ({} names)", record.name, record.real_names.len());
        Ok(())
    }

    pub fn list_matrices(&self) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT name FROM {} ORDER BY name", MATRIX_TABLE))?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    pub fn load_ratios(&self, name: &str) -> Result<Option<RatioRecord>> {
        let conn = self.get_conn()?;
        let raw: Option<(Vec<u8>, Vec<u8>)> = conn
            .query_row(
                &format!("SELECT channels, ratios FROM {} WHERE name = ?1", RATIO_TABLE),
                [name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match raw {
            Some((channels, ratios)) => Ok(Some(RatioRecord {
                name: name.to_string(),
                channels: serde_json::from_slice(&channels)?,
                ratios: serde_json::from_slice(&ratios)?,
            })),
            None => Ok(None),
        }
    }

    pub fn save_ratios(&self, record: &RatioRecord) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (name, channels, ratios, last_update) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET channels = excluded.channels,
                 ratios = excluded.ratios, last_update = excluded.last_update",
                RATIO_TABLE
            ),
            params![
                record.name,
                serde_json::to_vec(&record.channels)?,
                serde_json::to_vec(&record.ratios)?,
                now_seconds(),
            ],
        )?;
        debug!("Saved channel ratios '{}'", record.name);
        Ok(())
    }
}
