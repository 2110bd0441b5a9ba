//! Overview-row replication.

use std::path::PathBuf;

use dashmap::DashSet;
use rusqlite::types::Value;
use tracing::{debug, warn};

use crate::catalog::raw_rows::{self, RowValues};
use crate::catalog::sample_store::{register_sample_on, sample_exists_on};
use crate::catalog::{Catalog, OVERVIEW_TABLE};
use crate::config::SampleTriple;
use crate::error::{Error, Result};

/// Columns that stay catalog-local.
const LOCAL_ONLY_COLUMNS: [&str; 2] = ["id", "data_update_count"];

/// Sample triples already known to exist in a destination catalog.
pub type KnownSamples = DashSet<(PathBuf, SampleTriple)>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverviewOutcome {
    /// True when the destination had no row for the dataset.
    pub inserted: bool,
    /// Number of columns written on update.
    pub changed_columns: usize,
    /// Source columns the destination schema lacks.
    pub skipped_columns: Vec<String>,
    /// `data_synchronized` of the source row at copy time.
    pub source_data_synchronized: bool,
}

fn text(row: &RowValues, column: &str) -> String {
    match row.get(column) {
        Some(Value::Text(t)) => t.clone(),
        _ => String::new(),
    }
}

/// Copies the overview row of `uuid` from `source` into `dest`.
///
/// The copy is marked `table_synchronized` and shows `completed` only when
/// the source data is already replicated. Columns missing on the destination
/// are skipped and logged.
pub fn replicate_overview(source: &Catalog, dest: &Catalog, uuid: i64, known: &KnownSamples) -> Result<OverviewOutcome> {
    let mut row = {
        let conn = source.connection()?;
        raw_rows::select_row(&conn, OVERVIEW_TABLE, "uuid", uuid)?
            .ok_or_else(|| Error::NotFound(format!("dataset with uuid {}", uuid)))?
    };
    for column in LOCAL_ONLY_COLUMNS {
        row.remove(column);
    }
    let data_synchronized = raw_rows::as_bool(row.get("data_synchronized"));
    let completed = raw_rows::as_bool(row.get("completed"));
    row.insert("table_synchronized".into(), Value::Integer(1));
    row.insert(
        "completed".into(),
        Value::Integer((completed && data_synchronized) as i64),
    );
    let triple = SampleTriple::new(text(&row, "project"), text(&row, "set_up"), text(&row, "sample"));

    let dest_key = (dest.path().to_path_buf(), triple.clone());
    let outcome = dest.with_transaction(|tx| {
        let (kept, missing) = raw_rows::partition_columns(tx, OVERVIEW_TABLE, row)?;
        for column in &missing {
            let drift = Error::SchemaDrift {
                table: OVERVIEW_TABLE.to_string(),
                column: column.clone(),
            };
            warn!("Skipping column while replicating dataset {}: {}", uuid, drift);
        }
        let mut outcome = OverviewOutcome {
            skipped_columns: missing,
            source_data_synchronized: data_synchronized,
            ..Default::default()
        };
        match raw_rows::select_row(tx, OVERVIEW_TABLE, "uuid", uuid)? {
            None => {
                if !known.contains(&dest_key) && !sample_exists_on(tx, &triple)? {
                    register_sample_on(tx, &triple)?;
                }
                raw_rows::insert_row(tx, OVERVIEW_TABLE, &kept)?;
                outcome.inserted = true;
                outcome.changed_columns = kept.len();
            }
            Some(current) => {
                let changes = raw_rows::diff(&current, &kept);
                raw_rows::update_row(tx, OVERVIEW_TABLE, "uuid", uuid, &changes)?;
                outcome.changed_columns = changes.len();
            }
        }
        Ok(outcome)
    })?;
    known.insert(dest_key);

    debug!(
        "Replicated overview of dataset {} to {} ({} columns, inserted: {})",
        uuid,
        dest.path().display(),
        outcome.changed_columns,
        outcome.inserted
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MeasurementUpdate;
    use tempfile::TempDir;

    fn pair() -> (TempDir, Catalog, Catalog) {
        let dir = TempDir::new().unwrap();
        let local = Catalog::open_path(&dir.path().join("local.sqlite")).unwrap();
        let remote = Catalog::open_path(&dir.path().join("remote.sqlite")).unwrap();
        (dir, local, remote)
    }

    fn triple() -> SampleTriple {
        SampleTriple::new("six_dots", "XLD", "SQ21")
    }

    #[test]
    fn test_insert_then_diff_update() {
        let (_dir, local, remote) = pair();
        let known = KnownSamples::new();
        let (_, uuid) = local.create_measurement("ramsey", &triple(), 100.0, Some(3)).unwrap();

        let first = replicate_overview(&local, &remote, uuid, &known).unwrap();
        assert!(first.inserted);
        assert!(first.skipped_columns.is_empty());
        assert!(remote.samples.sample_exists(&triple()).unwrap());
        let copy = remote.find_by_uuid(uuid).unwrap().unwrap();
        assert!(copy.table_synchronized);
        assert_eq!(copy.exp_name, "ramsey");

        local.measurements.rename(uuid, "ramsey fringe").unwrap();
        let second = replicate_overview(&local, &remote, uuid, &known).unwrap();
        assert!(!second.inserted);
        assert_eq!(second.changed_columns, 1);
        assert_eq!(remote.find_by_uuid(uuid).unwrap().unwrap().exp_name, "ramsey fringe");

        let third = replicate_overview(&local, &remote, uuid, &known).unwrap();
        assert_eq!(third.changed_columns, 0);
    }

    #[test]
    fn test_completed_waits_for_data() {
        let (_dir, local, remote) = pair();
        let known = KnownSamples::new();
        let (_, uuid) = local.create_measurement("ramsey", &triple(), 100.0, Some(3)).unwrap();
        local
            .update_measurement(
                uuid,
                &MeasurementUpdate {
                    stop_time: Some(101.0),
                    completed: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        replicate_overview(&local, &remote, uuid, &known).unwrap();
        assert!(!remote.find_by_uuid(uuid).unwrap().unwrap().completed);

        local
            .update_measurement(
                uuid,
                &MeasurementUpdate {
                    data_synchronized: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        let outcome = replicate_overview(&local, &remote, uuid, &known).unwrap();
        assert!(outcome.source_data_synchronized);
        assert!(remote.find_by_uuid(uuid).unwrap().unwrap().completed);
    }

    #[test]
    fn test_missing_source_row() {
        let (_dir, local, remote) = pair();
        assert!(matches!(
            replicate_overview(&local, &remote, 5, &KnownSamples::new()),
            Err(Error::NotFound(_))
        ));
    }
}
