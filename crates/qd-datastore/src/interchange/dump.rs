//! Plain JSON form of a whole dataset.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{persist, ImportedOverview, ImportedParameter};
use crate::catalog::{Catalog, ParameterRow};
use crate::config::SampleTriple;
use crate::dataset::Dataset;
use crate::error::Result;

/// JSON numbers cannot hold NaN; unwritten samples travel as `null`.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::result::Result;

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| if v.is_nan() { None } else { Some(*v) }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values: Vec<Option<f64>> = Vec::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDump {
    pub name: String,
    pub label: String,
    pub unit: String,
    pub setpoint: bool,
    #[serde(default)]
    pub setpoint_local: bool,
    pub param_id: i64,
    pub param_id_m_param: i64,
    #[serde(default)]
    pub nth_set: i64,
    #[serde(default = "default_nth_dim")]
    pub nth_dim: i64,
    /// Names of the setpoints this parameter is recorded against.
    #[serde(default)]
    pub dependency: Vec<String>,
    pub shape: Vec<usize>,
    #[serde(with = "nan_as_null")]
    pub data: Vec<f64>,
}

fn default_nth_dim() -> i64 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDump {
    pub uuid: i64,
    pub name: String,
    pub project: String,
    pub setup: String,
    pub sample: String,
    #[serde(default)]
    pub created_by: String,
    pub start_time: f64,
    pub stop_time: Option<f64>,
    pub completed: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub snapshot: Value,
    #[serde(default)]
    pub metadata: Value,
    pub parameters: Vec<ParameterDump>,
}

/// Setpoint rows a dependency id may resolve to, preferring the ones recorded
/// for the same measurement.
fn resolve_dependency<'a>(rows: &'a [ParameterRow], owner: &ParameterRow, id: i64) -> Option<&'a ParameterRow> {
    let candidates = || rows.iter().filter(move |r| !r.is_measured() && r.param_id == id);
    candidates()
        .find(|r| r.param_id_m_param == owner.param_id_m_param)
        .or_else(|| candidates().next())
}

impl Dataset {
    pub fn to_dump(&self) -> Result<DatasetDump> {
        let rows = self.parameter_rows();
        let mut parameters = Vec::with_capacity(rows.len());
        for (position, row) in rows.iter().enumerate() {
            let dependency = row
                .dependency
                .iter()
                .filter_map(|id| resolve_dependency(rows, row, *id).map(|dep| dep.name.clone()))
                .collect();
            parameters.push(ParameterDump {
                name: row.name.clone(),
                label: row.label.clone(),
                unit: row.unit.clone(),
                setpoint: row.setpoint,
                setpoint_local: row.setpoint_local,
                param_id: row.param_id,
                param_id_m_param: row.param_id_m_param,
                nth_set: row.nth_set,
                nth_dim: row.nth_dim,
                dependency,
                shape: row.shape.clone(),
                data: self.row_values(position)?,
            });
        }
        let overview = self.overview();
        Ok(DatasetDump {
            uuid: overview.uuid,
            name: overview.exp_name.clone(),
            project: overview.project.clone(),
            setup: overview.setup.clone(),
            sample: overview.sample.clone(),
            created_by: overview.created_by.clone(),
            start_time: overview.start_time,
            stop_time: overview.stop_time,
            completed: overview.completed,
            starred: overview.starred,
            keywords: overview.keywords.clone(),
            snapshot: self.snapshot()?.clone(),
            metadata: self.metadata()?.clone(),
            parameters,
        })
    }
}

/// Imports `dump` into `catalog` under its own uuid; `Conflict` when the uuid
/// is already present. Returns the new local id.
pub fn import_dump(catalog: &Catalog, dump: &DatasetDump) -> Result<i64> {
    let params = dump
        .parameters
        .iter()
        .map(|p| {
            let dependency = p
                .dependency
                .iter()
                .filter_map(|name| {
                    dump.parameters
                        .iter()
                        .filter(|d| (d.setpoint || d.setpoint_local) && &d.name == name)
                        .find(|d| d.param_id_m_param == p.param_id_m_param)
                        .or_else(|| {
                            dump.parameters
                                .iter()
                                .find(|d| (d.setpoint || d.setpoint_local) && &d.name == name)
                        })
                        .map(|d| d.param_id)
                })
                .collect();
            ImportedParameter {
                row: ParameterRow {
                    param_index: 0,
                    param_id: p.param_id,
                    nth_set: p.nth_set,
                    nth_dim: p.nth_dim,
                    param_id_m_param: p.param_id_m_param,
                    setpoint: p.setpoint,
                    setpoint_local: p.setpoint_local,
                    name_global: Some(p.name.clone()),
                    name: p.name.clone(),
                    label: p.label.clone(),
                    unit: p.unit.clone(),
                    dependency,
                    shape: p.shape.clone(),
                    write_cursor: 0,
                    total_size: 0,
                    oid: 0,
                },
                data: p.data.clone(),
            }
        })
        .collect();
    let overview = ImportedOverview {
        uuid: dump.uuid,
        exp_name: dump.name.clone(),
        triple: SampleTriple::new(dump.project.clone(), dump.setup.clone(), dump.sample.clone()),
        created_by: dump.created_by.clone(),
        start_time: dump.start_time,
        stop_time: dump.stop_time,
        completed: dump.completed,
        starred: dump.starred,
        keywords: dump.keywords.clone(),
        snapshot: dump.snapshot.clone(),
        metadata: dump.metadata.clone(),
    };
    persist(catalog, overview, params)
}
