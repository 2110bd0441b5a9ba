//! Catalog module - SQLite-backed metadata store for samples, datasets,
//! parameter schemas, large objects and derived matrices.
pub mod large_object;
pub mod matrix_store;
pub mod measurement_store;
pub mod migration;
pub mod parameter_store;
pub mod raw_rows;
pub mod sample_store;
pub mod schema;

pub use large_object::LargeObjectStore;
pub use matrix_store::MatrixStore;
pub use measurement_store::{MeasurementStore, NewMeasurement, SearchFilter};
pub use migration::MigrationManager;
pub use parameter_store::ParameterStore;
pub use sample_store::SampleStore;
pub use schema::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OpenFlags, TransactionBehavior};
use tracing::info;

use crate::config::{ConnectionDescriptor, SampleTriple};
use crate::error::{Error, Result};
use crate::identifiers::generate_uuid;
use crate::validation::validate_dataset_name;

/// One catalog instance (local or remote).
pub struct Catalog {
    pub samples: SampleStore,
    pub measurements: MeasurementStore,
    pub parameters: ParameterStore,
    pub blobs: LargeObjectStore,
    pub matrices: MatrixStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
    path: PathBuf,
    readonly: bool,
}

/// Seconds since the Unix epoch, rounded to microseconds.
pub fn now_timestamp() -> f64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    micros as f64 / 1e6
}

impl Catalog {
    pub fn open(descriptor: &ConnectionDescriptor, pool_size: u32) -> Result<Self> {
        Self::open_with(&descriptor.path(), pool_size, descriptor.readonly, migration::CURRENT_VERSION)
    }

    /// Opens (creating if needed) the catalog file at `path` with default pool settings.
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open_with(path, 10, false, migration::CURRENT_VERSION)
    }

    /// Opens a catalog whose schema stops before the update counter column,
    /// as written by older clients.
    pub fn open_legacy(path: &Path) -> Result<Self> {
        Self::open_with(path, 10, false, 1)
    }

    fn open_with(path: &Path, pool_size: u32, readonly: bool, schema_version: i32) -> Result<Self> {
        info!("Opening catalog at: {}", path.display());
        if !readonly {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let flags = if readonly {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI
        };
        let manager = SqliteConnectionManager::file(path)
            .with_flags(flags)
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(Duration::from_secs(30))
            .test_on_check_out(true)
            .build(manager)?;

        if !readonly {
            let mut conn = pool.get()?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_to(schema_version)?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }

        let has_update_counter = {
            let conn = pool.get()?;
            migration::table_columns(&conn, OVERVIEW_TABLE)?
                .iter()
                .any(|c| c == "data_update_count")
        };

        let pool = Arc::new(pool);
        info!(
            "Catalog ready at {} (update counter: {})",
            path.display(),
            has_update_counter
        );
        Ok(Self {
            samples: SampleStore::new(Arc::clone(&pool)),
            measurements: MeasurementStore::new(Arc::clone(&pool), has_update_counter),
            parameters: ParameterStore::new(Arc::clone(&pool)),
            blobs: LargeObjectStore::new(Arc::clone(&pool)),
            matrices: MatrixStore::new(Arc::clone(&pool)),
            pool,
            path: path.to_path_buf(),
            readonly,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// True when both handles refer to the same catalog file.
    pub fn same_store(&self, other: &Catalog) -> bool {
        let canon = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
        canon(&self.path) == canon(&other.path)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::Config(format!(
                "catalog {} is opened read-only",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Runs `f` inside an immediate transaction; rolls back on error.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        self.ensure_writable()?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn connection(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn register_sample(&self, triple: &SampleTriple) -> Result<()> {
        self.ensure_writable()?;
        triple.validate()?;
        self.samples.register_sample(triple)
    }

    /// Allocates a uuid and inserts a fresh overview row in the shared layout.
    pub fn create_measurement(
        &self,
        name: &str,
        triple: &SampleTriple,
        start_time: f64,
        node_id: Option<u64>,
    ) -> Result<(i64, i64)> {
        validate_dataset_name(name)?;
        triple.validate()?;
        let uuid = generate_uuid(node_id);
        let new = NewMeasurement {
            uuid,
            exp_name: name.to_string(),
            project: triple.project.clone(),
            setup: triple.setup.clone(),
            sample: triple.sample.clone(),
            created_by: current_account(),
            start_time,
            stop_time: None,
            layout: DatasetLayout::Shared,
            snapshot: None,
            metadata: None,
            keywords: Vec::new(),
            completed: false,
            data_size: 0,
        };
        let id = self.with_transaction(|tx| {
            sample_store::register_sample_on(tx, triple)?;
            measurement_store::insert_measurement_on(tx, &new)
        })?;
        Ok((id, uuid))
    }

    pub fn update_measurement(&self, uuid: i64, update: &MeasurementUpdate) -> Result<()> {
        self.ensure_writable()?;
        self.measurements.update(uuid, update)
    }

    pub fn insert_parameters(&self, uuid: i64, rows: &[ParameterRow]) -> Result<()> {
        self.ensure_writable()?;
        let layout = self.layout_of(uuid)?;
        self.parameters.insert_parameters(&layout, uuid, rows)
    }

    pub fn update_cursors(&self, uuid: i64, cursors: &[(i64, i64)]) -> Result<()> {
        self.ensure_writable()?;
        let layout = self.layout_of(uuid)?;
        self.parameters.update_cursors(&layout, uuid, cursors)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<MeasurementRow>> {
        self.measurements.find_by_id(id)
    }

    pub fn find_by_uuid(&self, uuid: i64) -> Result<Option<MeasurementRow>> {
        self.measurements.find_by_uuid(uuid)
    }

    pub fn uuid_exists(&self, uuid: i64) -> Result<bool> {
        self.measurements.uuid_exists(uuid)
    }

    pub fn layout_of(&self, uuid: i64) -> Result<DatasetLayout> {
        self.find_by_uuid(uuid)?
            .map(|row| row.layout())
            .ok_or_else(|| Error::NotFound(format!("dataset with uuid {}", uuid)))
    }

    /// Overview row and parameter rows of one dataset.
    pub fn get_dataset_raw(&self, uuid: i64) -> Result<DatasetRaw> {
        let overview = self
            .find_by_uuid(uuid)?
            .ok_or_else(|| Error::NotFound(format!("dataset with uuid {}", uuid)))?;
        let parameters = self.parameters.get_parameters(&overview.layout(), uuid)?;
        Ok(DatasetRaw { overview, parameters })
    }

    pub fn search(&self, filter: &SearchFilter) -> Result<Vec<MeasurementSummary>> {
        self.measurements.search(filter)
    }

    pub fn get_stats(&self) -> Result<CatalogStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_catalog_stats(&conn)?)
    }

    pub fn run_maintenance(&self) -> Result<()> {
        self.ensure_writable()?;
        let mut conn = self.pool.get()?;
        Ok(migration::run_maintenance(&mut conn)?)
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        if self.readonly {
            return;
        }
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);");
        }
    }
}

/// Login name recorded as the dataset creator.
pub(crate) fn current_account() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_catalog() -> (TempDir, Catalog) {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&dir.path().join("catalog.sqlite")).unwrap();
        (dir, catalog)
    }

    fn triple() -> SampleTriple {
        SampleTriple::new("six_dots", "XLD", "SQ21")
    }

    fn param(index: i64, setpoint: bool, shape: Vec<usize>, oid: i64) -> ParameterRow {
        ParameterRow {
            param_index: index,
            param_id: 10 + index,
            nth_set: 0,
            nth_dim: if setpoint { 0 } else { -1 },
            param_id_m_param: 11,
            setpoint,
            setpoint_local: false,
            name_global: None,
            name: format!("p{}", index),
            label: format!("P{}", index),
            unit: "mV".into(),
            dependency: if setpoint { vec![] } else { vec![10] },
            total_size: shape.iter().product::<usize>() as i64,
            shape,
            write_cursor: 0,
            oid,
        }
    }

    // ===== Samples =====

    #[test]
    fn test_register_sample_is_idempotent() {
        let (_dir, catalog) = test_catalog();
        catalog.register_sample(&triple()).unwrap();
        catalog.register_sample(&triple()).unwrap();
        assert_eq!(catalog.samples.list_samples_registered().unwrap(), vec![triple()]);
        assert!(catalog.samples.sample_exists(&triple()).unwrap());
    }

    #[test]
    fn test_register_sample_validates() {
        let (_dir, catalog) = test_catalog();
        let bad = SampleTriple::new("9lives", "XLD", "SQ21");
        assert!(matches!(catalog.register_sample(&bad), Err(Error::InvalidName(_))));
    }

    // ===== Measurements =====

    #[test]
    fn test_create_and_find_measurement() {
        let (_dir, catalog) = test_catalog();
        let (id, uuid) = catalog.create_measurement("ramsey", &triple(), 1000.5, Some(1)).unwrap();
        assert!(catalog.uuid_exists(uuid).unwrap());

        let by_id = catalog.find_by_id(id).unwrap().unwrap();
        let by_uuid = catalog.find_by_uuid(uuid).unwrap().unwrap();
        assert_eq!(by_id, by_uuid);
        assert_eq!(by_id.exp_name, "ramsey");
        assert_eq!(by_id.layout(), DatasetLayout::Shared);
        assert_eq!(by_id.sync_location.as_deref(), Some(SHARED_LAYOUT_MARKER));
        assert_eq!(by_id.stop_time, None);
        assert_eq!(by_id.effective_stop_time(), 1000.5);
        assert_eq!(by_id.data_update_count, Some(0));
        assert!(!by_id.completed);
        assert!(catalog.samples.sample_exists(&triple()).unwrap());
    }

    #[test]
    fn test_create_measurement_rejects_bad_name() {
        let (_dir, catalog) = test_catalog();
        assert!(matches!(
            catalog.create_measurement("x", &triple(), 0.0, None),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn test_partial_update() {
        let (_dir, catalog) = test_catalog();
        let (_, uuid) = catalog.create_measurement("ramsey", &triple(), 10.0, Some(1)).unwrap();
        catalog
            .update_measurement(
                uuid,
                &MeasurementUpdate {
                    stop_time: Some(12.0),
                    completed: Some(true),
                    data_size: Some(80),
                    data_update_count: Some(3),
                    keywords: Some(vec!["t".into(), "P".into()]),
                    ..Default::default()
                },
            )
            .unwrap();
        let row = catalog.find_by_uuid(uuid).unwrap().unwrap();
        assert_eq!(row.stop_time, Some(12.0));
        assert!(row.completed);
        assert_eq!(row.data_size, 80);
        assert_eq!(row.data_update_count, Some(3));
        assert_eq!(row.keywords, vec!["t".to_string(), "P".to_string()]);
        assert_eq!(row.exp_name, "ramsey");
    }

    #[test]
    fn test_update_unknown_uuid() {
        let (_dir, catalog) = test_catalog();
        let update = MeasurementUpdate {
            starred: Some(true),
            ..Default::default()
        };
        assert!(matches!(catalog.update_measurement(42, &update), Err(Error::NotFound(_))));
    }

    // ===== Parameters =====

    #[test]
    fn test_parameters_and_cursors() {
        let (_dir, catalog) = test_catalog();
        let (_, uuid) = catalog.create_measurement("ramsey", &triple(), 0.0, Some(1)).unwrap();
        let rows = vec![param(0, true, vec![5], 1), param(1, false, vec![5], 2)];
        catalog.insert_parameters(uuid, &rows).unwrap();
        catalog.update_cursors(uuid, &[(0, 5), (1, 3)]).unwrap();

        let raw = catalog.get_dataset_raw(uuid).unwrap();
        assert_eq!(raw.parameters.len(), 2);
        assert_eq!(raw.parameters[0].write_cursor, 5);
        assert_eq!(raw.parameters[1].write_cursor, 3);
        assert_eq!(raw.parameters[1].dependency, vec![10]);
        assert!(catalog.update_cursors(uuid, &[(7, 1)]).is_err());
    }

    #[test]
    fn test_legacy_layout_tables() {
        let (_dir, catalog) = test_catalog();
        let layout = DatasetLayout::Legacy {
            table: "ramsey_1234_data".into(),
        };
        let rows = vec![param(0, true, vec![3], 1), param(1, false, vec![3], 2)];
        catalog.parameters.insert_parameters(&layout, 99, &rows).unwrap();
        catalog.parameters.update_cursors(&layout, 99, &[(1, 2)]).unwrap();
        let back = catalog.parameters.get_parameters(&layout, 99).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].param_index, 1);
        assert_eq!(back[1].write_cursor, 2);
        assert_eq!(catalog.parameters.count_parameters(&layout, 99).unwrap(), 2);
        catalog.parameters.delete_parameters(&layout, 99).unwrap();
        assert_eq!(catalog.parameters.count_parameters(&layout, 99).unwrap(), 0);
    }

    #[test]
    fn test_get_dataset_raw_not_found() {
        let (_dir, catalog) = test_catalog();
        assert!(matches!(catalog.get_dataset_raw(5), Err(Error::NotFound(_))));
    }

    // ===== Search =====

    #[test]
    fn test_keyword_search_is_conjunctive() {
        let (_dir, catalog) = test_catalog();
        let (_, a) = catalog.create_measurement("ramsey scan", &triple(), 100.0, Some(1)).unwrap();
        let (_, b) = catalog.create_measurement("rabi scan", &triple(), 200.0, Some(1)).unwrap();
        let other = SampleTriple::new("six_dots", "XLD", "SQ22");
        let (_, c) = catalog.create_measurement("ramsey", &other, 300.0, Some(1)).unwrap();
        catalog
            .update_measurement(a, &MeasurementUpdate { keywords: Some(vec!["t".into(), "P".into()]), ..Default::default() })
            .unwrap();
        catalog
            .update_measurement(b, &MeasurementUpdate { keywords: Some(vec!["P".into()]), ..Default::default() })
            .unwrap();
        catalog.measurements.set_starred(c, true).unwrap();

        let uuids = |filter: SearchFilter| -> Vec<i64> {
            catalog.search(&filter).unwrap().into_iter().map(|s| s.uuid).collect()
        };
        assert_eq!(uuids(SearchFilter::new().keyword("P")), vec![a, b]);
        assert_eq!(uuids(SearchFilter::new().keyword("P").keyword("t")), vec![a]);
        assert_eq!(uuids(SearchFilter::new().sample("SQ21").name_contains("ramsey")), vec![a]);
        assert_eq!(uuids(SearchFilter::new().starred(true)), vec![c]);
        assert_eq!(uuids(SearchFilter::new().started_between(Some(150.0), Some(300.0))), vec![b]);
        assert_eq!(uuids(SearchFilter::new().project("other")), Vec::<i64>::new());
    }

    #[test]
    fn test_browse_queries() {
        let (_dir, catalog) = test_catalog();
        catalog.create_measurement("ramsey", &triple(), 86_400.0 * 2.0, Some(1)).unwrap();
        let other = SampleTriple::new("six_dots", "F006", "SQ22");
        catalog.create_measurement("rabi", &other, 86_400.0 * 3.5, Some(1)).unwrap();

        let all = crate::config::SampleIdentity::default();
        assert_eq!(catalog.samples.list_setups(&all).unwrap(), vec!["F006", "XLD"]);
        let only_xld = crate::config::SampleIdentity {
            setup: Some("XLD".into()),
            ..Default::default()
        };
        assert_eq!(catalog.samples.list_samples(&only_xld).unwrap(), vec!["SQ21"]);
        assert_eq!(
            catalog.samples.dates_with_measurements(&other).unwrap(),
            vec!["1970-01-04".to_string()]
        );
        let newest = catalog.measurements.max_id(&SearchFilter::new()).unwrap().unwrap();
        assert_eq!(catalog.measurements.results_newer_than(newest - 1, &SearchFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_rename_and_star_clear_table_flag() {
        let (_dir, catalog) = test_catalog();
        let (_, uuid) = catalog.create_measurement("ramsey", &triple(), 0.0, Some(1)).unwrap();
        catalog
            .update_measurement(uuid, &MeasurementUpdate { table_synchronized: Some(true), ..Default::default() })
            .unwrap();
        catalog.measurements.rename(uuid, "ramsey v2").unwrap();
        let row = catalog.find_by_uuid(uuid).unwrap().unwrap();
        assert_eq!(row.exp_name, "ramsey v2");
        assert!(!row.table_synchronized);
        assert!(catalog.measurements.rename(uuid, "{bad}").is_err());
    }

    // ===== Update counter =====

    #[test]
    fn test_conditional_data_flag() {
        let (_dir, catalog) = test_catalog();
        let (_, uuid) = catalog.create_measurement("ramsey", &triple(), 0.0, Some(1)).unwrap();
        catalog
            .update_measurement(uuid, &MeasurementUpdate { data_update_count: Some(5), ..Default::default() })
            .unwrap();
        let err = catalog.measurements.mark_data_synchronized_if(uuid, Some(4)).unwrap_err();
        assert!(err.is_conflict());
        catalog.measurements.mark_data_synchronized_if(uuid, Some(5)).unwrap();
        assert!(catalog.find_by_uuid(uuid).unwrap().unwrap().data_synchronized);
    }

    #[test]
    fn test_legacy_catalog_has_no_counter() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_legacy(&dir.path().join("old.sqlite")).unwrap();
        let (_, uuid) = catalog.create_measurement("ramsey", &triple(), 0.0, Some(1)).unwrap();
        let row = catalog.find_by_uuid(uuid).unwrap().unwrap();
        assert_eq!(row.data_update_count, None);
        assert_eq!(catalog.measurements.update_count(uuid).unwrap(), None);
        // counter updates are dropped silently on older schemas
        catalog
            .update_measurement(uuid, &MeasurementUpdate { data_update_count: Some(2), ..Default::default() })
            .unwrap();
        assert_eq!(catalog.get_stats().unwrap().schema_version, 1);
    }
}
