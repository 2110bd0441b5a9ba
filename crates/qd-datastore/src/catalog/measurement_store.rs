//! Measurement overview storage: one row per dataset.
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::catalog::schema::*;
use crate::error::{Error, Result};
use crate::validation::validate_dataset_name;

const OVERVIEW_COLUMNS: &str = "id, uuid, exp_name, project, set_up, sample, creasted_by, \
     start_time, stop_time, exp_data_location, sync_location, snapshot, metadata, keywords, \
     starred, completed, data_size, data_synchronized, table_synchronized";

const SUMMARY_COLUMNS: &str = "id, uuid, exp_name, start_time, project, set_up, sample, starred, keywords";

/// Conjunctive filter for browser queries. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub id: Option<i64>,
    pub uuid: Option<i64>,
    pub project: Option<String>,
    pub setup: Option<String>,
    pub sample: Option<String>,
    pub name_contains: Option<String>,
    /// Inclusive lower bound on `start_time` (seconds since epoch).
    pub start_after: Option<f64>,
    /// Exclusive upper bound on `start_time`.
    pub start_before: Option<f64>,
    pub starred: Option<bool>,
    /// Every keyword listed must be present.
    pub keywords: Vec<String>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn setup(mut self, setup: impl Into<String>) -> Self {
        self.setup = Some(setup.into());
        self
    }

    pub fn sample(mut self, sample: impl Into<String>) -> Self {
        self.sample = Some(sample.into());
        self
    }

    pub fn name_contains(mut self, part: impl Into<String>) -> Self {
        self.name_contains = Some(part.into());
        self
    }

    pub fn started_between(mut self, after: Option<f64>, before: Option<f64>) -> Self {
        self.start_after = after;
        self.start_before = before;
        self
    }

    pub fn starred(mut self, starred: bool) -> Self {
        self.starred = Some(starred);
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    fn where_clause(&self, values: &mut Vec<Value>) -> String {
        let mut clauses: Vec<String> = Vec::new();
        let mut push = |sql: &str, value: Value, values: &mut Vec<Value>| {
            values.push(value);
            clauses.push(sql.replace('?', &format!("?{}", values.len())));
        };
        if let Some(id) = self.id {
            push("id = ?", Value::Integer(id), values);
        }
        if let Some(uuid) = self.uuid {
            push("uuid = ?", Value::Integer(uuid), values);
        }
        if let Some(project) = &self.project {
            push("project = ?", Value::Text(project.clone()), values);
        }
        if let Some(setup) = &self.setup {
            push("set_up = ?", Value::Text(setup.clone()), values);
        }
        if let Some(sample) = &self.sample {
            push("sample = ?", Value::Text(sample.clone()), values);
        }
        if let Some(part) = &self.name_contains {
            push("instr(exp_name, ?) > 0", Value::Text(part.clone()), values);
        }
        if let Some(after) = self.start_after {
            push("start_time >= ?", Value::Real(after), values);
        }
        if let Some(before) = self.start_before {
            push("start_time < ?", Value::Real(before), values);
        }
        if let Some(starred) = self.starred {
            push("starred = ?", Value::Integer(starred as i64), values);
        }
        for keyword in &self.keywords {
            push(
                "EXISTS (SELECT 1 FROM json_each(keywords) WHERE json_each.value = ?)",
                Value::Text(keyword.clone()),
                values,
            );
        }
        if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        }
    }
}

/// Fields of a new overview row.
#[derive(Debug, Clone)]
pub struct NewMeasurement {
    pub uuid: i64,
    pub exp_name: String,
    pub project: String,
    pub setup: String,
    pub sample: String,
    pub created_by: String,
    pub start_time: f64,
    pub stop_time: Option<f64>,
    pub layout: DatasetLayout,
    pub snapshot: Option<Vec<u8>>,
    pub metadata: Option<Vec<u8>>,
    pub keywords: Vec<String>,
    pub completed: bool,
    pub data_size: i64,
}

pub struct MeasurementStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    has_update_counter: bool,
}

impl MeasurementStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, has_update_counter: bool) -> Self {
        Self {
            pool,
            has_update_counter,
        }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Whether this catalog carries the `data_update_count` column.
    pub fn has_update_counter(&self) -> bool {
        self.has_update_counter
    }

    pub fn insert(&self, new: &NewMeasurement) -> Result<i64> {
        let conn = self.get_conn()?;
        insert_measurement_on(&conn, new)
    }

    pub fn update(&self, uuid: i64, update: &MeasurementUpdate) -> Result<()> {
        let conn = self.get_conn()?;
        update_measurement_on(&conn, uuid, update, self.has_update_counter)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<MeasurementRow>> {
        let conn = self.get_conn()?;
        self.find_where(&conn, "id = ?1", id)
    }

    pub fn find_by_uuid(&self, uuid: i64) -> Result<Option<MeasurementRow>> {
        let conn = self.get_conn()?;
        find_by_uuid_on(&conn, uuid, self.has_update_counter)
    }

    pub fn uuid_exists(&self, uuid: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        uuid_exists_on(&conn, uuid)
    }

    fn find_where(&self, conn: &Connection, clause: &str, key: i64) -> Result<Option<MeasurementRow>> {
        let sql = format!(
            "SELECT {}{} FROM {} WHERE {}",
            OVERVIEW_COLUMNS,
            counter_column(self.has_update_counter),
            OVERVIEW_TABLE,
            clause
        );
        let has_counter = self.has_update_counter;
        let row = conn
            .query_row(&sql, [key], |row| row_to_measurement(row, has_counter))
            .optional()?;
        Ok(row)
    }

    /// Uuids of datasets whose overview row awaits replication, sorted.
    pub fn pending_table_sync(&self) -> Result<Vec<i64>> {
        self.uuids_where("table_synchronized = 0")
    }

    /// Uuids of datasets whose data awaits replication, sorted.
    pub fn pending_data_sync(&self) -> Result<Vec<i64>> {
        self.uuids_where("data_synchronized = 0")
    }

    /// Datasets left running by a writer that never finished.
    pub fn interrupted(&self) -> Result<Vec<i64>> {
        self.uuids_where("completed = 0 AND stop_time IS NULL")
    }

    fn uuids_where(&self, clause: &str) -> Result<Vec<i64>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT uuid FROM {} WHERE {} ORDER BY uuid",
            OVERVIEW_TABLE, clause
        ))?;
        let uuids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(uuids)
    }

    /// Current update counter, or `None` when the column does not exist.
    pub fn update_count(&self, uuid: i64) -> Result<Option<i64>> {
        if !self.has_update_counter {
            return Ok(None);
        }
        let conn = self.get_conn()?;
        let count: Option<i64> = conn
            .query_row(
                &format!("SELECT data_update_count FROM {} WHERE uuid = ?1", OVERVIEW_TABLE),
                [uuid],
                |row| row.get(0),
            )
            .optional()?;
        count
            .map(Some)
            .ok_or_else(|| Error::NotFound(format!("dataset with uuid {}", uuid)))
    }

    /// Sets `data_synchronized = true` only if the update counter still equals
    /// `expected`. Returns `Conflict` when a writer advanced it in between.
    pub fn mark_data_synchronized_if(&self, uuid: i64, expected: Option<i64>) -> Result<()> {
        let conn = self.get_conn()?;
        let changed = match (self.has_update_counter, expected) {
            (true, Some(count)) => conn.execute(
                &format!(
                    "UPDATE {} SET data_synchronized = 1 WHERE uuid = ?1 AND data_update_count = ?2",
                    OVERVIEW_TABLE
                ),
                params![uuid, count],
            )?,
            _ => conn.execute(
                &format!("UPDATE {} SET data_synchronized = 1 WHERE uuid = ?1", OVERVIEW_TABLE),
                [uuid],
            )?,
        };
        if changed == 0 {
            if !uuid_exists_on(&conn, uuid)? {
                return Err(Error::NotFound(format!("dataset with uuid {}", uuid)));
            }
            return Err(Error::Conflict(format!(
                "update counter of dataset {} advanced during replication",
                uuid
            )));
        }
        Ok(())
    }

    pub fn rename(&self, uuid: i64, name: &str) -> Result<()> {
        validate_dataset_name(name)?;
        self.update(
            uuid,
            &MeasurementUpdate {
                exp_name: Some(name.to_string()),
                table_synchronized: Some(false),
                ..Default::default()
            },
        )?;
        info!("Renamed dataset {} to '{}'", uuid, name);
        Ok(())
    }

    pub fn set_starred(&self, uuid: i64, starred: bool) -> Result<()> {
        self.update(
            uuid,
            &MeasurementUpdate {
                starred: Some(starred),
                table_synchronized: Some(false),
                ..Default::default()
            },
        )
    }

    pub fn search(&self, filter: &SearchFilter) -> Result<Vec<MeasurementSummary>> {
        let conn = self.get_conn()?;
        let mut values = Vec::new();
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY uuid",
            SUMMARY_COLUMNS,
            OVERVIEW_TABLE,
            filter.where_clause(&mut values)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Highest id matching `filter`; browsers poll this to detect new datasets.
    pub fn max_id(&self, filter: &SearchFilter) -> Result<Option<i64>> {
        let conn = self.get_conn()?;
        let mut values = Vec::new();
        let sql = format!(
            "SELECT MAX(id) FROM {}{}",
            OVERVIEW_TABLE,
            filter.where_clause(&mut values)
        );
        let max: Option<i64> = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(max)
    }

    pub fn results_newer_than(&self, id: i64, filter: &SearchFilter) -> Result<Vec<MeasurementSummary>> {
        Ok(self
            .search(filter)?
            .into_iter()
            .filter(|summary| summary.id > id)
            .collect())
    }
}

fn counter_column(has_counter: bool) -> &'static str {
    if has_counter {
        ", data_update_count"
    } else {
        ""
    }
}

pub(crate) fn find_by_uuid_on(conn: &Connection, uuid: i64, has_counter: bool) -> Result<Option<MeasurementRow>> {
    let sql = format!(
        "SELECT {}{} FROM {} WHERE uuid = ?1",
        OVERVIEW_COLUMNS,
        counter_column(has_counter),
        OVERVIEW_TABLE
    );
    let row = conn
        .query_row(&sql, [uuid], |row| row_to_measurement(row, has_counter))
        .optional()?;
    Ok(row)
}

pub(crate) fn uuid_exists_on(conn: &Connection, uuid: i64) -> Result<bool> {
    let found = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE uuid = ?1", OVERVIEW_TABLE),
            [uuid],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn insert_measurement_on(conn: &Connection, new: &NewMeasurement) -> Result<i64> {
    if uuid_exists_on(conn, new.uuid)? {
        return Err(Error::Conflict(format!("uuid {} already exists", new.uuid)));
    }
    let (exp_data_location, sync_location) = match &new.layout {
        DatasetLayout::Shared => (None, Some(SHARED_LAYOUT_MARKER.to_string())),
        DatasetLayout::Legacy { table } => (Some(table.clone()), None),
    };
    conn.execute(
        &format!(
            "INSERT INTO {} (uuid, exp_name, project, set_up, sample, creasted_by, start_time,
             stop_time, exp_data_location, sync_location, snapshot, metadata, keywords, completed,
             data_size, data_synchronized, table_synchronized)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0, 0)",
            OVERVIEW_TABLE
        ),
        params![
            new.uuid,
            new.exp_name,
            new.project,
            new.setup,
            new.sample,
            new.created_by,
            new.start_time,
            new.stop_time,
            exp_data_location,
            sync_location,
            new.snapshot,
            new.metadata,
            serde_json::to_string(&new.keywords)?,
            new.completed,
            new.data_size,
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!("Inserted overview row id={} uuid={}", id, new.uuid);
    Ok(id)
}

pub(crate) fn update_measurement_on(
    conn: &Connection,
    uuid: i64,
    update: &MeasurementUpdate,
    has_counter: bool,
) -> Result<()> {
    if update.is_empty() {
        return Ok(());
    }
    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    let mut set = |column: &str, value: Value| {
        values.push(value);
        sets.push(format!("{} = ?{}", column, values.len()));
    };
    let blob = |b: &Option<Vec<u8>>| b.clone().map(Value::Blob).unwrap_or(Value::Null);

    if let Some(name) = &update.exp_name {
        set("exp_name", Value::Text(name.clone()));
    }
    if let Some(stop) = update.stop_time {
        set("stop_time", Value::Real(stop));
    }
    if let Some(metadata) = &update.metadata {
        set("metadata", blob(metadata));
    }
    if let Some(snapshot) = &update.snapshot {
        set("snapshot", blob(snapshot));
    }
    if let Some(keywords) = &update.keywords {
        set("keywords", Value::Text(serde_json::to_string(keywords)?));
    }
    if let Some(starred) = update.starred {
        set("starred", Value::Integer(starred as i64));
    }
    if let Some(size) = update.data_size {
        set("data_size", Value::Integer(size));
    }
    if let Some(flag) = update.data_synchronized {
        set("data_synchronized", Value::Integer(flag as i64));
    }
    if let Some(flag) = update.table_synchronized {
        set("table_synchronized", Value::Integer(flag as i64));
    }
    if let Some(flag) = update.completed {
        set("completed", Value::Integer(flag as i64));
    }
    if let Some(count) = update.data_update_count {
        if has_counter {
            set("data_update_count", Value::Integer(count));
        }
    }
    if sets.is_empty() {
        return Ok(());
    }
    values.push(Value::Integer(uuid));
    let sql = format!(
        "UPDATE {} SET {} WHERE uuid = ?{}",
        OVERVIEW_TABLE,
        sets.join(", "),
        values.len()
    );
    let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
    if changed == 0 {
        return Err(Error::NotFound(format!("dataset with uuid {}", uuid)));
    }
    Ok(())
}

fn parse_keywords(raw: Option<String>) -> Vec<String> {
    raw.and_then(|text| serde_json::from_str::<Vec<String>>(&text).ok())
        .unwrap_or_default()
}

fn row_to_measurement(row: &Row, has_counter: bool) -> rusqlite::Result<MeasurementRow> {
    Ok(MeasurementRow {
        id: row.get(0)?,
        uuid: row.get(1)?,
        exp_name: row.get(2)?,
        project: row.get(3)?,
        setup: row.get(4)?,
        sample: row.get(5)?,
        created_by: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        start_time: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
        stop_time: row.get(8)?,
        exp_data_location: row.get(9)?,
        sync_location: row.get(10)?,
        snapshot: row.get(11)?,
        metadata: row.get(12)?,
        keywords: parse_keywords(row.get(13)?),
        starred: row.get(14)?,
        completed: row.get(15)?,
        data_size: row.get::<_, Option<i64>>(16)?.unwrap_or(0),
        data_synchronized: row.get(17)?,
        table_synchronized: row.get(18)?,
        data_update_count: if has_counter { Some(row.get(19)?) } else { None },
    })
}

fn row_to_summary(row: &Row) -> rusqlite::Result<MeasurementSummary> {
    Ok(MeasurementSummary {
        id: row.get(0)?,
        uuid: row.get(1)?,
        exp_name: row.get(2)?,
        start_time: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        project: row.get(4)?,
        setup: row.get(5)?,
        sample: row.get(6)?,
        starred: row.get(7)?,
        keywords: parse_keywords(row.get(8)?),
    })
}
