//! Table definitions and row types for the measurement catalog.

use serde::{Deserialize, Serialize};

use crate::config::SampleTriple;

pub const SAMPLE_TABLE: &str = "sample_info_overview";
pub const OVERVIEW_TABLE: &str = "global_measurement_overview";
pub const PARAMETER_TABLE: &str = "measurement_parameters";
pub const MATRIX_TABLE: &str = "derived_matrices";
pub const RATIO_TABLE: &str = "channel_ratios";

/// Value of `sync_location` marking a dataset whose schema rows live in the
/// shared parameter table. Existing catalogs depend on this exact string.
pub const SHARED_LAYOUT_MARKER: &str = "New measurement_parameters";

/// Where a dataset's parameter schema rows are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetLayout {
    /// Rows in the shared `measurement_parameters` table, keyed by uuid.
    Shared,
    /// Rows in a per-dataset table named by `exp_data_location`.
    Legacy { table: String },
}

/// One row of the measurement overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub id: i64,
    pub uuid: i64,
    pub exp_name: String,
    pub project: String,
    pub setup: String,
    pub sample: String,
    pub created_by: String,
    pub start_time: f64,
    /// `None` while the dataset is being written.
    pub stop_time: Option<f64>,
    pub exp_data_location: Option<String>,
    pub sync_location: Option<String>,
    pub snapshot: Option<Vec<u8>>,
    pub metadata: Option<Vec<u8>>,
    pub keywords: Vec<String>,
    pub starred: bool,
    pub completed: bool,
    pub data_size: i64,
    pub data_synchronized: bool,
    pub table_synchronized: bool,
    /// `None` on catalogs that predate the update counter column.
    pub data_update_count: Option<i64>,
}

impl MeasurementRow {
    pub fn triple(&self) -> SampleTriple {
        SampleTriple::new(&self.project, &self.setup, &self.sample)
    }

    pub fn layout(&self) -> DatasetLayout {
        match (&self.sync_location, &self.exp_data_location) {
            (Some(marker), _) if marker == SHARED_LAYOUT_MARKER => DatasetLayout::Shared,
            (_, Some(table)) if !table.is_empty() => DatasetLayout::Legacy { table: table.clone() },
            _ => DatasetLayout::Shared,
        }
    }

    /// Stop time as shown to readers: the start time until the dataset ends.
    pub fn effective_stop_time(&self) -> f64 {
        self.stop_time.unwrap_or(self.start_time)
    }

    pub fn is_running(&self) -> bool {
        !self.completed && self.stop_time.is_none()
    }
}

/// One parameter schema row: a setpoint axis or a measured array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRow {
    pub param_index: i64,
    pub param_id: i64,
    pub nth_set: i64,
    pub nth_dim: i64,
    pub param_id_m_param: i64,
    pub setpoint: bool,
    pub setpoint_local: bool,
    pub name_global: Option<String>,
    pub name: String,
    pub label: String,
    pub unit: String,
    pub dependency: Vec<i64>,
    pub shape: Vec<usize>,
    pub write_cursor: i64,
    pub total_size: i64,
    pub oid: i64,
}

impl ParameterRow {
    pub fn is_measured(&self) -> bool {
        !self.setpoint && !self.setpoint_local
    }
}

/// Overview row plus its parameter rows.
#[derive(Debug, Clone)]
pub struct DatasetRaw {
    pub overview: MeasurementRow,
    pub parameters: Vec<ParameterRow>,
}

/// Partial overview update; unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementUpdate {
    pub exp_name: Option<String>,
    pub stop_time: Option<f64>,
    pub metadata: Option<Option<Vec<u8>>>,
    pub snapshot: Option<Option<Vec<u8>>>,
    pub keywords: Option<Vec<String>>,
    pub starred: Option<bool>,
    pub data_size: Option<i64>,
    pub data_synchronized: Option<bool>,
    pub table_synchronized: Option<bool>,
    pub completed: Option<bool>,
    pub data_update_count: Option<i64>,
}

impl MeasurementUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Short listing used by browser queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementSummary {
    pub id: i64,
    pub uuid: i64,
    pub exp_name: String,
    pub start_time: f64,
    pub project: String,
    pub setup: String,
    pub sample: String,
    pub starred: bool,
    pub keywords: Vec<String>,
}

/// Persisted derived matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixRecord {
    pub name: String,
    pub real_names: Vec<String>,
    pub virtual_names: Vec<String>,
    pub matrix: Vec<Vec<f64>>,
}

/// Persisted per-channel ratios.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioRecord {
    pub name: String,
    pub channels: Vec<String>,
    pub ratios: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogStats {
    pub schema_version: i32,
    pub total_datasets: i64,
    pub running_datasets: i64,
    pub pending_table_sync: i64,
    pub pending_data_sync: i64,
    pub total_blobs: i64,
    pub blob_bytes: i64,
    pub database_size_bytes: i64,
}
