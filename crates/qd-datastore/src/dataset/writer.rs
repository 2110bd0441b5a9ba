//! Write side of a dataset: registration, streaming appends with periodic
//! cursor commits, and sealing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::buffer::{BufferStore, BufferWriter, SAMPLE_BYTES};
use crate::catalog::measurement_store::{insert_measurement_on, update_measurement_on};
use crate::catalog::parameter_store::{insert_parameters_on, update_cursors_on};
use crate::catalog::sample_store::register_sample_on;
use crate::catalog::{current_account, now_timestamp, Catalog, DatasetLayout, MeasurementUpdate, NewMeasurement, ParameterRow};
use crate::config::{Config, SampleTriple};
use crate::dataset::encode_json_blob;
use crate::error::{Error, Result};
use crate::identifiers::generate_uuid;
use crate::validation::{validate_dataset_name, validate_parameter_name};

/// Role of a declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterRole {
    /// A swept axis with `points` values.
    Setpoint { points: usize },
    /// A measured quantity over the named setpoint axes, with an optional
    /// inner shape for array-valued readings.
    Measured { axes: Vec<String>, inner_shape: Vec<usize> },
}

/// Declaration of one parameter of a new dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    pub name: String,
    pub label: String,
    pub unit: String,
    pub role: ParameterRole,
}

impl ParameterSpec {
    pub fn setpoint(name: &str, label: &str, unit: &str, points: usize) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
            role: ParameterRole::Setpoint { points },
        }
    }

    pub fn measured(name: &str, label: &str, unit: &str, axes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
            role: ParameterRole::Measured {
                axes: axes.iter().map(|a| a.to_string()).collect(),
                inner_shape: Vec::new(),
            },
        }
    }

    /// Adds trailing dimensions for readings that return an array per point.
    pub fn with_inner_shape(mut self, shape: &[usize]) -> Self {
        if let ParameterRole::Measured { inner_shape, .. } = &mut self.role {
            *inner_shape = shape.to_vec();
        }
        self
    }

    pub fn is_setpoint(&self) -> bool {
        matches!(self.role, ParameterRole::Setpoint { .. })
    }

    fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }
}

/// Keywords derived from parameter labels: unique setpoint labels in reverse
/// order, then unique measured labels.
pub fn generate_keywords(rows: &[ParameterRow]) -> Vec<String> {
    fn unique<'a>(labels: impl Iterator<Item = &'a str>) -> Vec<String> {
        let mut seen = HashSet::new();
        labels
            .filter(|label| seen.insert(*label))
            .map(str::to_string)
            .collect()
    }
    let label_of = |row: &ParameterRow| -> String {
        if row.label.is_empty() {
            row.name.clone()
        } else {
            row.label.clone()
        }
    };
    let set_labels: Vec<String> = rows.iter().filter(|r| !r.is_measured()).map(label_of).collect();
    let get_labels: Vec<String> = rows.iter().filter(|r| r.is_measured()).map(label_of).collect();

    let mut keywords = unique(set_labels.iter().map(String::as_str));
    keywords.reverse();
    keywords.extend(unique(get_labels.iter().map(String::as_str)));
    keywords
}

/// Collects everything needed to register a dataset.
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    name: String,
    parameters: Vec<ParameterSpec>,
    snapshot: Option<Value>,
    metadata: Option<Value>,
    keywords: Option<Vec<String>>,
}

impl DatasetBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            parameters: Vec::new(),
            snapshot: None,
            metadata: None,
            keywords: None,
        }
    }

    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn snapshot(mut self, snapshot: Value) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Explicit keywords; when unset they are generated from labels.
    pub fn keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = Some(keywords);
        self
    }

    fn validate(&self) -> Result<()> {
        validate_dataset_name(&self.name)?;
        let mut names = HashSet::new();
        for spec in &self.parameters {
            validate_parameter_name(&spec.name)?;
            if !names.insert(spec.name.as_str()) {
                return Err(Error::InvalidData(format!(
                    "parameter '{}' is declared twice",
                    spec.name
                )));
            }
        }
        let setpoints: HashMap<&str, &ParameterSpec> = self
            .parameters
            .iter()
            .filter(|p| p.is_setpoint())
            .map(|p| (p.name.as_str(), p))
            .collect();
        let mut measured = 0;
        for spec in &self.parameters {
            match &spec.role {
                ParameterRole::Setpoint { points } if *points == 0 => {
                    return Err(Error::InvalidData(format!(
                        "setpoint '{}' needs at least one point",
                        spec.name
                    )));
                }
                ParameterRole::Setpoint { .. } => {}
                ParameterRole::Measured { axes, inner_shape } => {
                    measured += 1;
                    if axes.is_empty() && inner_shape.is_empty() {
                        return Err(Error::InvalidData(format!(
                            "measured parameter '{}' has neither axes nor an inner shape",
                            spec.name
                        )));
                    }
                    if inner_shape.iter().any(|n| *n == 0) {
                        return Err(Error::InvalidData(format!(
                            "measured parameter '{}' has an empty inner dimension",
                            spec.name
                        )));
                    }
                    if let Some(missing) = axes.iter().find(|a| !setpoints.contains_key(a.as_str())) {
                        return Err(Error::InvalidData(format!(
                            "measured parameter '{}' depends on undeclared setpoint '{}'",
                            spec.name, missing
                        )));
                    }
                }
            }
        }
        if measured == 0 {
            return Err(Error::InvalidData(format!(
                "dataset '{}' declares no measured parameters",
                self.name
            )));
        }
        Ok(())
    }

    /// Lays out schema rows: per measured parameter, its own row followed by
    /// one row per setpoint axis, all sharing the grid shape.
    fn layout_rows(&self) -> Vec<(ParameterRow, String)> {
        let points: HashMap<&str, usize> = self
            .parameters
            .iter()
            .filter_map(|p| match p.role {
                ParameterRole::Setpoint { points } => Some((p.name.as_str(), points)),
                _ => None,
            })
            .collect();
        let specs: HashMap<&str, &ParameterSpec> =
            self.parameters.iter().map(|p| (p.name.as_str(), p)).collect();

        let mut rows = Vec::new();
        let mut next_id: i64 = 1;
        for spec in &self.parameters {
            let (axes, inner_shape) = match &spec.role {
                ParameterRole::Measured { axes, inner_shape } => (axes, inner_shape),
                ParameterRole::Setpoint { .. } => continue,
            };
            let grid: Vec<usize> = axes.iter().map(|a| points[a.as_str()]).collect();
            let mut shape = grid.clone();
            shape.extend_from_slice(inner_shape);

            let m_param = next_id;
            let axis_ids: Vec<i64> = (0..axes.len()).map(|i| m_param + 1 + i as i64).collect();
            next_id += 1 + axes.len() as i64;

            rows.push((
                ParameterRow {
                    param_index: rows.len() as i64,
                    param_id: m_param,
                    nth_set: 0,
                    nth_dim: -1,
                    param_id_m_param: m_param,
                    setpoint: false,
                    setpoint_local: false,
                    name_global: Some(spec.name.clone()),
                    name: spec.name.clone(),
                    label: spec.display_label().to_string(),
                    unit: spec.unit.clone(),
                    dependency: axis_ids.clone(),
                    total_size: shape.iter().product::<usize>() as i64,
                    shape,
                    write_cursor: 0,
                    oid: 0,
                },
                spec.name.clone(),
            ));
            for (dim, (axis, axis_id)) in axes.iter().zip(axis_ids).enumerate() {
                let axis_spec = specs[axis.as_str()];
                rows.push((
                    ParameterRow {
                        param_index: rows.len() as i64,
                        param_id: axis_id,
                        nth_set: 0,
                        nth_dim: dim as i64,
                        param_id_m_param: m_param,
                        setpoint: true,
                        setpoint_local: false,
                        name_global: Some(axis_spec.name.clone()),
                        name: axis_spec.name.clone(),
                        label: axis_spec.display_label().to_string(),
                        unit: axis_spec.unit.clone(),
                        dependency: Vec::new(),
                        total_size: grid.iter().product::<usize>() as i64,
                        shape: grid.clone(),
                        write_cursor: 0,
                        oid: 0,
                    },
                    axis_spec.name.clone(),
                ));
            }
        }
        rows
    }

    /// Registers the dataset in `catalog` and returns its writer.
    pub fn create(self, catalog: Arc<Catalog>, config: &Config) -> Result<DatasetWriter> {
        self.validate()?;
        let triple = config.require_identity()?;
        let layout = self.layout_rows();

        let store = BufferStore::new(catalog.blobs.clone(), config.prealloc_samples);
        let mut rows = Vec::with_capacity(layout.len());
        let mut writers = Vec::with_capacity(layout.len());
        let mut targets: HashMap<String, Vec<usize>> = HashMap::new();
        for (mut row, target) in layout {
            let writer = store.create(&row.shape)?;
            row.oid = writer.handle();
            targets.entry(target).or_default().push(rows.len());
            rows.push(row);
            writers.push(writer);
        }

        let keywords = self.keywords.clone().unwrap_or_else(|| generate_keywords(&rows));
        let snapshot = self
            .snapshot
            .as_ref()
            .map(|v| encode_json_blob(v, config.compress_snapshots))
            .transpose()?;
        let metadata = self
            .metadata
            .as_ref()
            .map(|v| encode_json_blob(v, config.compress_snapshots))
            .transpose()?;

        let start_time = now_timestamp();
        let uuid = generate_uuid(config.node_id);
        let new = NewMeasurement {
            uuid,
            exp_name: self.name.clone(),
            project: triple.project.clone(),
            setup: triple.setup.clone(),
            sample: triple.sample.clone(),
            created_by: current_account(),
            start_time,
            stop_time: None,
            layout: DatasetLayout::Shared,
            snapshot,
            metadata,
            keywords,
            completed: false,
            data_size: 0,
        };
        let id = catalog.with_transaction(|tx| {
            register_sample_on(tx, &triple)?;
            let id = insert_measurement_on(tx, &new)?;
            insert_parameters_on(tx, &DatasetLayout::Shared, uuid, &rows)?;
            Ok(id)
        })?;
        info!(
            "Starting measurement with id {} - {} (uuid {}, {} parameters)",
            id,
            self.name,
            uuid,
            rows.len()
        );

        let published = vec![0; rows.len()];
        Ok(DatasetWriter {
            catalog,
            id,
            uuid,
            name: self.name,
            triple,
            start_time,
            rows,
            writers,
            targets,
            published,
            update_count: 0,
            commit_interval: config.commit_interval(),
            last_commit: Instant::now(),
            state: WriterState::Open,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    Finished,
    Aborted,
}

/// Exclusive writer of one dataset.
pub struct DatasetWriter {
    catalog: Arc<Catalog>,
    id: i64,
    uuid: i64,
    name: String,
    triple: SampleTriple,
    start_time: f64,
    rows: Vec<ParameterRow>,
    writers: Vec<BufferWriter>,
    targets: HashMap<String, Vec<usize>>,
    published: Vec<usize>,
    update_count: i64,
    commit_interval: Duration,
    last_commit: Instant,
    state: WriterState,
}

impl DatasetWriter {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn uuid(&self) -> i64 {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triple(&self) -> &SampleTriple {
        &self.triple
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn parameters(&self) -> &[ParameterRow] {
        &self.rows
    }

    /// Update counter value written by the last commit.
    pub fn update_count(&self) -> i64 {
        self.update_count
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(Error::InvalidData(format!(
                "dataset {} is no longer open for writing ({:?})",
                self.uuid, self.state
            )));
        }
        Ok(())
    }

    /// Appends samples per parameter name. A setpoint name feeds every row
    /// that records that axis. Commits when the commit interval has elapsed.
    pub fn add_result(&mut self, values: &[(&str, &[f64])]) -> Result<()> {
        self.ensure_open()?;
        // Validate the whole call before touching any buffer.
        let mut incoming: HashMap<usize, usize> = HashMap::new();
        for (name, samples) in values {
            let targets = self.targets.get(*name).ok_or_else(|| {
                Error::InvalidData(format!(
                    "parameter '{}' is not declared in dataset '{}'",
                    name, self.name
                ))
            })?;
            for &idx in targets {
                *incoming.entry(idx).or_default() += samples.len();
            }
        }
        for (&idx, &count) in &incoming {
            let writer = &self.writers[idx];
            if writer.cursor() + count > writer.total_size() {
                return Err(Error::InvalidData(format!(
                    "appending {} samples to parameter '{}' of dataset '{}' overflows its size ({} of {} used)",
                    count,
                    self.rows[idx].name,
                    self.name,
                    writer.cursor(),
                    writer.total_size()
                )));
            }
        }
        for (name, samples) in values {
            for &idx in &self.targets[*name] {
                self.writers[idx].append(samples)?;
            }
        }
        if self.last_commit.elapsed() >= self.commit_interval {
            self.commit()?;
        }
        Ok(())
    }

    /// Flushes blobs, then publishes cursors and bumps the update counter.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.commit_with(MeasurementUpdate::default(), false)
    }

    fn commit_with(&mut self, mut update: MeasurementUpdate, seal: bool) -> Result<()> {
        for writer in &mut self.writers {
            if seal {
                writer.seal()?;
            } else {
                writer.flush()?;
            }
        }
        let cursors: Vec<(i64, i64)> = self
            .writers
            .iter()
            .enumerate()
            .filter(|(idx, w)| w.flushed_cursor() != self.published[*idx])
            .map(|(idx, w)| (self.rows[idx].param_index, w.flushed_cursor() as i64))
            .collect();
        if cursors.is_empty() && update.is_empty() {
            self.last_commit = Instant::now();
            return Ok(());
        }

        let next_count = self.update_count + 1;
        update.data_synchronized = Some(false);
        update.data_update_count = Some(next_count);
        let has_counter = self.catalog.measurements.has_update_counter();
        let uuid = self.uuid;
        self.catalog.with_transaction(|tx| {
            update_cursors_on(tx, &DatasetLayout::Shared, uuid, &cursors)?;
            update_measurement_on(tx, uuid, &update, has_counter)
        })?;

        self.update_count = next_count;
        for (idx, writer) in self.writers.iter().enumerate() {
            self.published[idx] = writer.flushed_cursor();
            self.rows[idx].write_cursor = writer.flushed_cursor() as i64;
        }
        self.last_commit = Instant::now();
        debug!(
            "Committed {} cursors for dataset {} (update count {})",
            cursors.len(),
            uuid,
            next_count
        );
        Ok(())
    }

    fn data_size(&self) -> i64 {
        self.writers
            .iter()
            .map(|w| (w.flushed_cursor() * SAMPLE_BYTES) as i64)
            .sum()
    }

    fn close_writers(&mut self) {
        for writer in &mut self.writers {
            if let Err(e) = writer.close() {
                warn!("Failed to close blob {}: {}", writer.handle(), e);
            }
        }
    }

    /// Seals every buffer (unwritten samples stay NaN), publishes the final
    /// cursors and marks the dataset completed.
    pub fn finish(mut self) -> Result<i64> {
        self.end(true)?;
        Ok(self.uuid)
    }

    /// Publishes what was written so far and ends the dataset as not completed.
    pub fn abort(mut self) -> Result<i64> {
        self.end(false)?;
        Ok(self.uuid)
    }

    fn end(&mut self, completed: bool) -> Result<()> {
        self.ensure_open()?;
        if completed {
            for writer in &mut self.writers {
                writer.seal()?;
            }
        } else {
            for writer in &mut self.writers {
                writer.flush()?;
            }
        }
        let stop_time = now_timestamp().max(self.start_time);
        let update = MeasurementUpdate {
            stop_time: Some(stop_time),
            data_size: Some(self.data_size()),
            completed: Some(completed),
            table_synchronized: Some(false),
            ..Default::default()
        };
        self.commit_with(update, completed)?;
        self.close_writers();
        self.state = if completed {
            WriterState::Finished
        } else {
            WriterState::Aborted
        };
        info!(
            "Measurement {} ({}) {} after {:.1} s",
            self.id,
            self.name,
            if completed { "completed" } else { "aborted" },
            stop_time - self.start_time
        );
        Ok(())
    }
}

impl Drop for DatasetWriter {
    fn drop(&mut self) {
        if self.state == WriterState::Open {
            warn!(
                "Dataset {} dropped without finish; saving as aborted",
                self.uuid
            );
            if let Err(e) = self.end(false) {
                warn!("Failed to abort dataset {}: {}", self.uuid, e);
            }
        }
    }
}

/// Marks datasets left running by a crashed writer as aborted and returns
/// their uuids. Must not run while a writer is active on this catalog.
pub fn recover_interrupted(catalog: &Catalog) -> Result<Vec<i64>> {
    let uuids = catalog.measurements.interrupted()?;
    for uuid in &uuids {
        let raw = catalog.get_dataset_raw(*uuid)?;
        let data_size: i64 = raw
            .parameters
            .iter()
            .map(|p| p.write_cursor * SAMPLE_BYTES as i64)
            .sum();
        catalog.update_measurement(
            *uuid,
            &MeasurementUpdate {
                stop_time: Some(raw.overview.start_time),
                data_size: Some(data_size),
                completed: Some(false),
                data_synchronized: Some(false),
                table_synchronized: Some(false),
                ..Default::default()
            },
        )?;
        warn!(
            "Recovered interrupted dataset {} ({}) with {} bytes committed",
            uuid, raw.overview.exp_name, data_size
        );
    }
    Ok(uuids)
}
