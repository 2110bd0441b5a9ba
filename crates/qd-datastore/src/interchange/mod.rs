//! Moving datasets in and out of a catalog as documents: a plain JSON dump
//! and a labeled n-dimensional form.

pub mod dump;
pub mod labeled;

pub use dump::{import_dump, DatasetDump, ParameterDump};
pub use labeled::import_labeled;

use serde_json::Value;
use tracing::{info, warn};

use crate::buffer::{BufferStore, SAMPLE_BYTES};
use crate::catalog::measurement_store::insert_measurement_on;
use crate::catalog::parameter_store::insert_parameters_on;
use crate::catalog::sample_store::register_sample_on;
use crate::catalog::{Catalog, DatasetLayout, NewMeasurement, ParameterRow};
use crate::config::SampleTriple;
use crate::dataset::encode_json_blob;
use crate::error::{Error, Result};
use crate::validation::validate_dataset_name;

/// Overview fields of a dataset being imported.
pub(crate) struct ImportedOverview {
    pub uuid: i64,
    pub exp_name: String,
    pub triple: SampleTriple,
    pub created_by: String,
    pub start_time: f64,
    pub stop_time: Option<f64>,
    pub completed: bool,
    pub starred: bool,
    pub keywords: Vec<String>,
    pub snapshot: Value,
    pub metadata: Value,
}

/// Schema row (without blob or cursor) plus its full sample array.
pub(crate) struct ImportedParameter {
    pub row: ParameterRow,
    pub data: Vec<f64>,
}

fn encode_optional(value: &Value) -> Result<Option<Vec<u8>>> {
    match value {
        Value::Null => Ok(None),
        value => encode_json_blob(value, true).map(Some),
    }
}

/// Valid prefix of an imported array: everything when completed, else up to
/// the last non-NaN sample.
fn imported_cursor(data: &[f64], completed: bool) -> usize {
    if completed {
        data.len()
    } else {
        data.iter().rposition(|v| !v.is_nan()).map(|i| i + 1).unwrap_or(0)
    }
}

/// Writes blobs and catalog rows for an imported dataset under its original
/// uuid. Returns the new local id.
pub(crate) fn persist(catalog: &Catalog, overview: ImportedOverview, params: Vec<ImportedParameter>) -> Result<i64> {
    validate_dataset_name(&overview.exp_name)?;
    overview.triple.validate()?;
    if catalog.uuid_exists(overview.uuid)? {
        return Err(Error::Conflict(format!(
            "dataset with uuid {} already exists in {}",
            overview.uuid,
            catalog.path().display()
        )));
    }

    let store = BufferStore::new(catalog.blobs.clone(), 1);
    let mut rows = Vec::with_capacity(params.len());
    let mut data_size = 0i64;
    for (position, param) in params.into_iter().enumerate() {
        let mut row = param.row;
        let total: usize = row.shape.iter().product();
        if param.data.len() != total {
            release(catalog, &rows);
            return Err(Error::InvalidData(format!(
                "parameter '{}' holds {} samples for shape {:?}",
                row.name,
                param.data.len(),
                row.shape
            )));
        }
        let cursor = imported_cursor(&param.data, overview.completed);
        let mut writer = match store.create(&row.shape) {
            Ok(writer) => writer,
            Err(e) => {
                release(catalog, &rows);
                return Err(e);
            }
        };
        row.oid = writer.handle();
        row.param_index = position as i64;
        row.total_size = total as i64;
        row.write_cursor = cursor as i64;
        rows.push(row);
        let written = writer
            .append(&param.data[..cursor])
            .and_then(|_| writer.seal())
            .and_then(|_| writer.close());
        if let Err(e) = written {
            release(catalog, &rows);
            return Err(e);
        }
        data_size += (cursor * SAMPLE_BYTES) as i64;
    }

    let new = NewMeasurement {
        uuid: overview.uuid,
        exp_name: overview.exp_name.clone(),
        project: overview.triple.project.clone(),
        setup: overview.triple.setup.clone(),
        sample: overview.triple.sample.clone(),
        created_by: overview.created_by.clone(),
        start_time: overview.start_time,
        stop_time: overview.stop_time,
        layout: DatasetLayout::Shared,
        snapshot: encode_optional(&overview.snapshot)?,
        metadata: encode_optional(&overview.metadata)?,
        keywords: overview.keywords.clone(),
        completed: overview.completed,
        data_size,
    };
    let inserted = catalog.with_transaction(|tx| {
        register_sample_on(tx, &overview.triple)?;
        let id = insert_measurement_on(tx, &new)?;
        insert_parameters_on(tx, &DatasetLayout::Shared, overview.uuid, &rows)?;
        Ok(id)
    });
    let id = match inserted {
        Ok(id) => id,
        Err(e) => {
            release(catalog, &rows);
            return Err(e);
        }
    };
    if overview.starred {
        catalog.measurements.set_starred(overview.uuid, true)?;
    }
    info!(
        "Imported dataset {} ({}) as id {} with {} parameters",
        overview.uuid,
        overview.exp_name,
        id,
        rows.len()
    );
    Ok(id)
}

fn release(catalog: &Catalog, rows: &[ParameterRow]) {
    for row in rows {
        if let Err(e) = catalog.blobs.unlink(row.oid) {
            warn!("Failed to release blob {} of aborted import: {}", row.oid, e);
        }
    }
}
