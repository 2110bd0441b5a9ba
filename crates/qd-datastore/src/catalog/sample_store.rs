//! Sample registry and the browse queries built on it.
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use crate::catalog::schema::{OVERVIEW_TABLE, SAMPLE_TABLE};
use crate::config::{SampleIdentity, SampleTriple};
use crate::error::Result;

pub struct SampleStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SampleStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Idempotent insert of a sample triple.
    pub fn register_sample(&self, triple: &SampleTriple) -> Result<()> {
        let conn = self.get_conn()?;
        register_sample_on(&conn, triple)
    }

    pub fn sample_exists(&self, triple: &SampleTriple) -> Result<bool> {
        let conn = self.get_conn()?;
        sample_exists_on(&conn, triple)
    }

    pub fn list_samples_registered(&self) -> Result<Vec<SampleTriple>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT project, set_up, sample FROM {} ORDER BY project, set_up, sample",
            SAMPLE_TABLE
        ))?;
        let triples = stmt
            .query_map([], |row| {
                Ok(SampleTriple {
                    project: row.get(0)?,
                    setup: row.get(1)?,
                    sample: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triples)
    }

    /// Distinct projects with datasets, constrained by any given setup/sample.
    pub fn list_projects(&self, filter: &SampleIdentity) -> Result<Vec<String>> {
        self.distinct_values("project", filter)
    }

    pub fn list_setups(&self, filter: &SampleIdentity) -> Result<Vec<String>> {
        self.distinct_values("set_up", filter)
    }

    pub fn list_samples(&self, filter: &SampleIdentity) -> Result<Vec<String>> {
        self.distinct_values("sample", filter)
    }

    fn distinct_values(&self, column: &str, filter: &SampleIdentity) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        for (col, value) in [
            ("project", &filter.project),
            ("set_up", &filter.setup),
            ("sample", &filter.sample),
        ] {
            if col == column {
                continue;
            }
            if let Some(value) = value {
                values.push(value.clone());
                clauses.push(format!("{} = ?{}", col, values.len()));
            }
        }
        let mut sql = format!("SELECT DISTINCT {} FROM {}", column, OVERVIEW_TABLE);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {}", column));

        let mut stmt = conn.prepare(&sql)?;
        let out = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    /// Distinct UTC dates (`YYYY-MM-DD`) on which datasets of `triple` started.
    pub fn dates_with_measurements(&self, triple: &SampleTriple) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT date(start_time, 'unixepoch') AS day FROM {}
             WHERE project = ?1 AND set_up = ?2 AND sample = ?3
             ORDER BY day DESC",
            OVERVIEW_TABLE
        ))?;
        let days = stmt
            .query_map(params![triple.project, triple.setup, triple.sample], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(days)
    }
}

pub(crate) fn register_sample_on(conn: &Connection, triple: &SampleTriple) -> Result<()> {
    let hash = format!("{}{}{}", triple.setup, triple.project, triple.sample);
    let inserted = conn.execute(
        &format!(
            "INSERT INTO {} (sample_info_hash, set_up, project, sample) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            SAMPLE_TABLE
        ),
        params![hash, triple.setup, triple.project, triple.sample],
    )?;
    if inserted > 0 {
        debug!(
            "Registered sample {}/{}/{}",
            triple.project, triple.setup, triple.sample
        );
    }
    Ok(())
}

pub(crate) fn sample_exists_on(conn: &Connection, triple: &SampleTriple) -> Result<bool> {
    let found = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE project = ?1 AND set_up = ?2 AND sample = ?3",
                SAMPLE_TABLE
            ),
            params![triple.project, triple.setup, triple.sample],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}
