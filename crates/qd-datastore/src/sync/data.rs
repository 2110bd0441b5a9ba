//! Data replication: parameter schema rows and blob tails.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::buffer::{fill_nan_on, SAMPLE_BYTES};
use crate::catalog::large_object::{lo_create, lo_size, lo_unlink};
use crate::catalog::parameter_store::{
    count_parameters_on, delete_parameters_on, get_parameters_on, insert_parameters_on, update_cursors_on,
};
use crate::catalog::{Catalog, DatasetLayout, ParameterRow};
use crate::error::{Error, Result};

/// Result of one data replication step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataOutcome {
    /// Source update counter read before copying; `None` on catalogs
    /// without the counter column.
    pub update_count: Option<i64>,
    /// True when the source writer has ended (finished or aborted).
    pub source_ended: bool,
    /// True when the destination schema rows were rebuilt.
    pub rebuilt_schema: bool,
    pub parameters_advanced: usize,
    pub bytes_copied: u64,
}

/// Replaces the destination schema rows of `uuid` with copies of `rows`,
/// each bound to a fresh empty blob with cursor 0.
fn rebuild_schema(dest: &Catalog, layout: &DatasetLayout, uuid: i64, rows: &[ParameterRow]) -> Result<()> {
    dest.with_transaction(|tx| {
        for stale in get_parameters_on(tx, layout, uuid)? {
            match lo_unlink(tx, stale.oid) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        delete_parameters_on(tx, layout, uuid)?;
        let mut fresh = Vec::with_capacity(rows.len());
        for row in rows {
            let mut copy = row.clone();
            copy.oid = lo_create(tx)?;
            copy.write_cursor = 0;
            fresh.push(copy);
        }
        insert_parameters_on(tx, layout, uuid, &fresh)
    })
}

/// Streams samples `[from, to)` of one parameter from `source` to `dest` in
/// chunks of at most `chunk_bytes`.
fn copy_range(source: &Catalog, dest: &Catalog, src_oid: i64, dst_oid: i64, from: usize, to: usize, chunk_bytes: usize) -> Result<u64> {
    let chunk_samples = (chunk_bytes / SAMPLE_BYTES).max(1);
    let mut copied = 0u64;
    let mut start = from;
    while start < to {
        let end = to.min(start + chunk_samples);
        let offset = (start * SAMPLE_BYTES) as u64;
        let len = (end - start) * SAMPLE_BYTES;
        let bytes = source.blobs.read_at(src_oid, offset, len)?;
        if bytes.len() != len {
            return Err(Error::InvalidData(format!(
                "blob {} holds {} bytes at offset {}, cursor promised {}",
                src_oid,
                bytes.len(),
                offset,
                len
            )));
        }
        dest.blobs.write_at(dst_oid, offset, &bytes)?;
        copied += len as u64;
        start = end;
    }
    Ok(copied)
}

/// Brings the destination parameter rows and blobs of `uuid` up to the
/// source cursors.
///
/// The destination overview row must exist; its layout decides where the
/// schema rows go. Blobs past the copied prefix are NaN-filled to the full
/// array size so partial replicas read like live ones.
pub fn replicate_data(source: &Catalog, dest: &Catalog, uuid: i64, chunk_bytes: usize) -> Result<DataOutcome> {
    let source_row = source
        .find_by_uuid(uuid)?
        .ok_or_else(|| Error::NotFound(format!("dataset with uuid {}", uuid)))?;
    let mut outcome = DataOutcome {
        update_count: source_row.data_update_count,
        source_ended: !source_row.is_running(),
        ..Default::default()
    };
    let dest_layout = dest.layout_of(uuid)?;

    let source_params = source.parameters.get_parameters(&source_row.layout(), uuid)?;
    let dest_count = {
        let conn = dest.connection()?;
        count_parameters_on(&conn, &dest_layout, uuid)?
    };
    if dest_count != source_params.len() as i64 {
        info!(
            "Rebuilding {} parameter rows of dataset {} on {} (had {})",
            source_params.len(),
            uuid,
            dest.path().display(),
            dest_count
        );
        rebuild_schema(dest, &dest_layout, uuid, &source_params)?;
        outcome.rebuilt_schema = true;
    }

    let dest_params: HashMap<i64, ParameterRow> = dest
        .parameters
        .get_parameters(&dest_layout, uuid)?
        .into_iter()
        .map(|row| (row.param_index, row))
        .collect();

    let mut advanced = Vec::new();
    for param in &source_params {
        let target = dest_params.get(&param.param_index).ok_or_else(|| {
            Error::InvalidData(format!(
                "parameter {} of dataset {} missing on destination",
                param.param_index, uuid
            ))
        })?;
        let from = target.write_cursor.max(0) as usize;
        let to = param.write_cursor.clamp(0, param.total_size) as usize;
        if to > from {
            outcome.bytes_copied += copy_range(source, dest, param.oid, target.oid, from, to, chunk_bytes)?;
            advanced.push((param.param_index, to as i64));
        }
        let total = param.total_size.max(0) as usize;
        let conn = dest.connection()?;
        let held = lo_size(&conn, target.oid)? as usize / SAMPLE_BYTES;
        if held < total {
            fill_nan_on(&conn, target.oid, held.max(to), total)?;
        }
    }

    if !advanced.is_empty() {
        dest.with_transaction(|tx| update_cursors_on(tx, &dest_layout, uuid, &advanced))?;
    }
    outcome.parameters_advanced = advanced.len();
    debug!(
        "Replicated data of dataset {}: {} parameters advanced, {} bytes",
        uuid,
        outcome.parameters_advanced,
        outcome.bytes_copied
    );
    Ok(outcome)
}

/// Marks `uuid` as data-synchronized in `local` unless its update counter
/// moved away from `snapshot`. Returns `Conflict` when it did.
pub fn mark_synchronized(local: &Catalog, uuid: i64, snapshot: Option<i64>) -> Result<()> {
    local.measurements.mark_data_synchronized_if(uuid, snapshot)
}
