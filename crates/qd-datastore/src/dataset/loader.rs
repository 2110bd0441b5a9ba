//! Building the read-side object model from catalog rows.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::buffer::{BufferStore, BufferView, SharedReader};
use crate::catalog::{Catalog, DatasetRaw, ParameterRow};
use crate::dataset::{Dataset, ParameterNode};
use crate::error::{Error, Result};
use crate::sync::{SyncAgent, DEFAULT_CHUNK_BYTES};

/// Loads a dataset by its catalog-local id. Ids are not shared between
/// catalogs, so only `catalog` is searched.
pub fn load_by_id(catalog: &Arc<Catalog>, id: i64) -> Result<Dataset> {
    let row = catalog
        .find_by_id(id)?
        .ok_or_else(|| Error::NotFound(format!("dataset with id {}", id)))?;
    let raw = catalog.get_dataset_raw(row.uuid)?;
    from_raw(Arc::clone(catalog), raw)
}

/// Loads a dataset by uuid from `local`, falling back to `remote`. With
/// `sync_to_local` a remote hit is first replicated into `local` and loaded
/// from there.
pub fn load_by_uuid(local: &Arc<Catalog>, remote: &Arc<Catalog>, uuid: i64, sync_to_local: bool) -> Result<Dataset> {
    if local.uuid_exists(uuid)? {
        return from_raw(Arc::clone(local), local.get_dataset_raw(uuid)?);
    }
    if !remote.same_store(local) && remote.uuid_exists(uuid)? {
        if sync_to_local {
            info!("Dataset {} only found remotely; pulling it to the local catalog", uuid);
            SyncAgent::new(Arc::clone(local), Arc::clone(remote), DEFAULT_CHUNK_BYTES).pull(uuid)?;
            return from_raw(Arc::clone(local), local.get_dataset_raw(uuid)?);
        }
        return from_raw(Arc::clone(remote), remote.get_dataset_raw(uuid)?);
    }
    Err(Error::NotFound(format!("dataset with uuid {}", uuid)))
}

fn display_label(row: &ParameterRow) -> String {
    if row.label.is_empty() {
        row.name.clone()
    } else {
        row.label.clone()
    }
}

/// Axis of a setpoint grid that carries its values: the only axis of a 1-D
/// setpoint, else its recorded dimension, else its position in the
/// dependency list.
fn primary_axis(setpoint: &ParameterRow, position: usize) -> usize {
    let ndim = setpoint.shape.len();
    if ndim <= 1 {
        0
    } else if setpoint.nth_dim >= 0 && (setpoint.nth_dim as usize) < ndim {
        setpoint.nth_dim as usize
    } else if position < ndim {
        position
    } else {
        0
    }
}

fn setpoint_node(
    rows: &[ParameterRow],
    readers: &[SharedReader],
    measured: &ParameterRow,
    position: usize,
    dependency: i64,
) -> Result<Option<ParameterNode>> {
    let candidates = || {
        rows.iter()
            .enumerate()
            .filter(move |(_, r)| !r.is_measured() && r.param_id == dependency)
    };
    let found = candidates()
        .find(|(_, r)| r.param_id_m_param == measured.param_id_m_param)
        .or_else(|| candidates().next());
    let (idx, row) = match found {
        Some(found) => found,
        None => {
            warn!(
                "Parameter '{}' depends on missing setpoint {}; axis left unnamed",
                measured.name, dependency
            );
            return Ok(None);
        }
    };
    let node = ParameterNode::setpoint(
        row.name.clone(),
        row.param_index,
        row.name.clone(),
        display_label(row),
        row.unit.clone(),
        BufferView::new(Arc::clone(&readers[idx])),
        primary_axis(row, position),
    )?;
    Ok(Some(node))
}

/// Opens live readers for every parameter row and builds the node tree.
///
/// Measured rows are grouped by the measurement they belong to; a group with
/// one output is named `m{i}`, larger groups `m{i}_{j}` ordered by position in
/// the group.
pub fn from_raw(catalog: Arc<Catalog>, raw: DatasetRaw) -> Result<Dataset> {
    let DatasetRaw { overview, parameters: rows } = raw;
    let store = BufferStore::new(catalog.blobs.clone(), 1);

    let mut readers = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut reader = store.reader(row.oid, &row.shape)?;
        reader.sync_to(row.write_cursor.max(0) as usize)?;
        readers.push(reader.into_shared());
    }

    let mut groups: Vec<(i64, Vec<usize>)> = Vec::new();
    for (idx, row) in rows.iter().enumerate().filter(|(_, r)| r.is_measured()) {
        match groups.iter_mut().find(|(m_param, _)| *m_param == row.param_id_m_param) {
            Some((_, members)) => members.push(idx),
            None => groups.push((row.param_id_m_param, vec![idx])),
        }
    }

    let mut nodes = Vec::new();
    for (group, (_, members)) in groups.iter_mut().enumerate() {
        members.sort_by_key(|idx| rows[*idx].nth_set);
        for (position, &idx) in members.iter().enumerate() {
            let row = &rows[idx];
            let key = if members.len() == 1 {
                format!("m{}", group + 1)
            } else {
                format!("m{}_{}", group + 1, position + 1)
            };
            let axes = row
                .dependency
                .iter()
                .enumerate()
                .map(|(k, dep)| setpoint_node(&rows, &readers, row, k, *dep))
                .collect::<Result<Vec<_>>>()?;
            nodes.push(ParameterNode::measured(
                key,
                row.param_index,
                row.name.clone(),
                display_label(row),
                row.unit.clone(),
                BufferView::new(Arc::clone(&readers[idx])),
                axes,
            )?);
        }
    }
    debug!(
        "Loaded dataset {} with {} parameter rows and {} nodes",
        overview.uuid,
        rows.len(),
        nodes.len()
    );
    Ok(Dataset::assemble(catalog, overview, rows, readers, nodes))
}
