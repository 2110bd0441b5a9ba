//! Labeled n-dimensional form, shaped like xarray's `Dataset.to_dict()`:
//! `attrs`, `coords`, `data_vars` and `dims`.

use chrono::{DateTime, NaiveDateTime};
use ndarray::{ArrayViewD, Axis};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{persist, ImportedOverview, ImportedParameter};
use crate::catalog::{current_account, Catalog, ParameterRow};
use crate::config::SampleTriple;
use crate::dataset::{decode_json_blob, encode_json_blob, to_datetime, Dataset};
use crate::error::{Error, Result};

/// Synthetic param ids of imported coordinates start here.
pub const COORD_PARAM_ID_OFFSET: i64 = 1000;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn nested(data: &ArrayViewD<f64>) -> Value {
    if data.ndim() == 0 {
        return number(data.iter().next().copied().unwrap_or(f64::NAN));
    }
    Value::Array(data.axis_iter(Axis(0)).map(|sub| nested(&sub)).collect())
}

fn same_values(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
}

fn format_time(seconds: f64) -> String {
    to_datetime(seconds)
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// Parses `YYYY-MM-DD HH:MM:SS[.ffffff]` (taken as UTC) or RFC 3339.
pub fn parse_time(text: &str) -> Result<f64> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc().timestamp_micros() as f64 / 1e6);
    }
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.timestamp_micros() as f64 / 1e6)
        .map_err(|e| Error::InvalidData(format!("unreadable timestamp '{}': {}", text, e)))
}

/// Adds a coordinate under `base`, reusing an identical existing one and
/// otherwise suffixing `-1`, `-2`, ...
fn add_coord(coords: &mut Map<String, Value>, base: &str, values: &[f64], attrs: Value) -> String {
    let mut name = base.to_string();
    let mut dup = 0;
    while let Some(existing) = coords.get(&name) {
        let existing_values: Vec<f64> = existing["data"]
            .as_array()
            .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(f64::NAN)).collect())
            .unwrap_or_default();
        if existing["attrs"] == attrs && same_values(&existing_values, values) {
            return name;
        }
        dup += 1;
        name = format!("{}-{}", base, dup);
    }
    coords.insert(
        name.clone(),
        json!({
            "dims": [name.clone()],
            "attrs": attrs,
            "data": values.iter().map(|v| number(*v)).collect::<Vec<_>>(),
        }),
    );
    name
}

impl Dataset {
    /// Exports every measured node with its setpoint axes as coordinates.
    pub fn to_labeled(&self) -> Result<Value> {
        let mut coords = Map::new();
        let mut data_vars = Map::new();
        let mut dims = Map::new();

        for node in self.nodes() {
            let data = node.data()?;
            let mut var_dims = Vec::with_capacity(node.ndim());
            for dim in 0..node.ndim() {
                let name = match node.axis(dim) {
                    Ok(axis) => {
                        let values: Vec<f64> = axis.data()?.iter().copied().collect();
                        let attrs = json!({"units": axis.unit(), "long_name": axis.label()});
                        add_coord(&mut coords, axis.name(), &values, attrs)
                    }
                    Err(_) => format!("{}_dim{}", node.name(), dim),
                };
                dims.insert(name.clone(), json!(data.shape().get(dim).copied().unwrap_or(0)));
                var_dims.push(name);
            }

            let (m_param, nth_set) = self
                .parameter_rows()
                .iter()
                .find(|r| r.param_index == node.param_index())
                .map(|r| (r.param_id_m_param, r.nth_set))
                .unwrap_or((node.param_index(), 0));
            let mut name = node.name().to_string();
            let mut dup = 1;
            while data_vars.contains_key(&name) {
                dup += 1;
                name = format!("{}-{}", node.name(), dup);
            }
            data_vars.insert(
                name,
                json!({
                    "dims": var_dims,
                    "attrs": {
                        "units": node.unit(),
                        "long_name": node.label(),
                        "_param_index": [m_param, nth_set],
                        "param_name": node.name(),
                    },
                    "data": nested(&data.view()),
                }),
            );
        }

        let overview = self.overview();
        let mut attrs = json!({
            "title": overview.exp_name,
            "uuid": overview.uuid,
            "id": overview.id,
            "sample_name": overview.sample,
            "project": overview.project,
            "set_up": overview.setup,
            "created_by": overview.created_by,
            "measurement_time": format_time(overview.start_time),
            "completed_time": format_time(overview.effective_stop_time()),
            "metadata": serde_json::to_string(self.metadata()?)?,
            "keywords": overview.keywords,
            "completed": overview.completed as i64,
            "application": format!("qd-datastore:{}", env!("CARGO_PKG_VERSION")),
        });
        let snapshot = self.snapshot()?;
        if !snapshot.is_null() {
            attrs["snapshot-gzip"] = json!(encode_json_blob(snapshot, true)?);
        }

        Ok(json!({
            "attrs": attrs,
            "coords": coords,
            "data_vars": data_vars,
            "dims": dims,
        }))
    }
}

fn attr_str<'a>(attrs: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    attrs.get(key).and_then(Value::as_str)
}

fn require_str<'a>(attrs: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    attr_str(attrs, key).ok_or_else(|| Error::InvalidData(format!("labeled dataset has no '{}' attribute", key)))
}

/// Flattens nested JSON lists into row-major samples and their shape.
fn flatten(value: &Value) -> Result<(Vec<usize>, Vec<f64>)> {
    fn walk(value: &Value, depth: usize, shape: &mut Vec<usize>, out: &mut Vec<f64>) -> Result<()> {
        match value {
            Value::Array(items) => {
                if shape.len() == depth {
                    // a new depth can only open before the first sample
                    if !out.is_empty() {
                        return Err(Error::InvalidData("ragged data array".into()));
                    }
                    shape.push(items.len());
                } else if shape.get(depth) != Some(&items.len()) {
                    return Err(Error::InvalidData("ragged data array".into()));
                }
                items.iter().try_for_each(|item| walk(item, depth + 1, shape, out))
            }
            Value::Null => {
                check_leaf(depth, shape)?;
                out.push(f64::NAN);
                Ok(())
            }
            Value::Number(n) => {
                check_leaf(depth, shape)?;
                out.push(n.as_f64().unwrap_or(f64::NAN));
                Ok(())
            }
            other => Err(Error::InvalidData(format!("non-numeric sample {}", other))),
        }
    }
    fn check_leaf(depth: usize, shape: &[usize]) -> Result<()> {
        if depth < shape.len() {
            return Err(Error::InvalidData("ragged data array".into()));
        }
        Ok(())
    }
    let mut shape = Vec::new();
    let mut out = Vec::new();
    walk(value, 0, &mut shape, &mut out)?;
    Ok((shape, out))
}

/// Repeats `values` along dimension `dim` of `grid`.
fn broadcast(values: &[f64], grid: &[usize], dim: usize) -> Vec<f64> {
    let total: usize = grid.iter().product();
    let stride: usize = grid[dim + 1..].iter().product();
    (0..total)
        .map(|i| values[(i / stride) % grid[dim]])
        .collect()
}

fn decode_snapshot(attrs: &Map<String, Value>) -> Result<Value> {
    if let Some(bytes) = attrs.get("snapshot-gzip").and_then(Value::as_array) {
        let bytes = bytes
            .iter()
            .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| Error::InvalidData("snapshot-gzip is not a byte list".into()))?;
        return decode_json_blob(&bytes);
    }
    json_attr(attrs, "snapshot")
}

/// Attribute holding JSON either as an encoded string or inline.
fn json_attr(attrs: &Map<String, Value>, key: &str) -> Result<Value> {
    match attrs.get(key) {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(Value::String(text)) => Ok(serde_json::from_str(text)?),
        Some(value) => Ok(value.clone()),
    }
}

struct Coordinate {
    name: String,
    label: String,
    unit: String,
    values: Vec<f64>,
}

fn var_attr_text(attrs: &Value, key: &str) -> Option<String> {
    attrs.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Imports a labeled document into `catalog` under its `uuid` attribute.
///
/// Coordinates become setpoint rows with param ids from 1000 upward in
/// coordinate order; each data variable becomes a measured row depending on
/// the coordinates of its dimensions. Returns the new local id.
pub fn import_labeled(catalog: &Catalog, doc: &Value) -> Result<i64> {
    let attrs = doc
        .get("attrs")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::InvalidData("labeled dataset has no attrs".into()))?;
    let uuid = attrs
        .get("uuid")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::InvalidData("labeled dataset has no integer uuid".into()))?;
    let setup = attr_str(attrs, "setup")
        .or_else(|| attr_str(attrs, "set_up"))
        .ok_or_else(|| Error::InvalidData("labeled dataset has no 'setup' attribute".into()))?;
    let triple = SampleTriple::new(require_str(attrs, "project")?, setup, require_str(attrs, "sample_name")?);
    let start_time = parse_time(require_str(attrs, "measurement_time")?)?;
    let stop_time = attr_str(attrs, "completed_time").map(parse_time).transpose()?;
    let completed = match attrs.get("completed") {
        Some(Value::Bool(b)) => *b,
        Some(v) => v.as_i64().unwrap_or(0) != 0,
        None => false,
    };
    let keywords = attrs
        .get("keywords")
        .and_then(Value::as_array)
        .map(|k| k.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let mut coordinates = Vec::new();
    if let Some(coords) = doc.get("coords").and_then(Value::as_object) {
        for (name, coord) in coords {
            let (shape, values) = flatten(coord.get("data").unwrap_or(&Value::Null))?;
            if shape.len() != 1 {
                return Err(Error::InvalidData(format!(
                    "coordinate '{}' is not one-dimensional",
                    name
                )));
            }
            let coord_attrs = coord.get("attrs").cloned().unwrap_or(Value::Null);
            coordinates.push(Coordinate {
                name: name.clone(),
                label: var_attr_text(&coord_attrs, "long_name").unwrap_or_else(|| name.clone()),
                unit: var_attr_text(&coord_attrs, "units").unwrap_or_default(),
                values,
            });
        }
    }

    let data_vars = doc
        .get("data_vars")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::InvalidData("labeled dataset has no data_vars".into()))?;
    let mut params: Vec<ImportedParameter> = Vec::new();
    for (position, (var_name, var)) in data_vars.iter().enumerate() {
        let var_attrs = var.get("attrs").cloned().unwrap_or(Value::Null);
        let (shape, data) = flatten(var.get("data").unwrap_or(&Value::Null))?;
        let var_dims: Vec<&str> = var
            .get("dims")
            .and_then(Value::as_array)
            .map(|d| d.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if var_dims.len() != shape.len() {
            return Err(Error::InvalidData(format!(
                "variable '{}' names {} dims for {}-dimensional data",
                var_name,
                var_dims.len(),
                shape.len()
            )));
        }
        let (m_param, nth_set) = match var_attrs.get("_param_index").and_then(Value::as_array) {
            Some(index) if index.len() == 2 => (
                index[0].as_i64().unwrap_or(position as i64 + 1),
                index[1].as_i64().unwrap_or(0),
            ),
            _ => (position as i64 + 1, 0),
        };

        // coordinates cover a leading run of dims; the rest are inner dims
        let mut axes = Vec::new();
        for (dim, dim_name) in var_dims.iter().enumerate() {
            match coordinates.iter().position(|c| c.name == *dim_name) {
                Some(ci) if axes.len() == dim => {
                    if coordinates[ci].values.len() != shape[dim] {
                        return Err(Error::InvalidData(format!(
                            "coordinate '{}' has {} values, dimension {} of '{}' has {}",
                            dim_name,
                            coordinates[ci].values.len(),
                            dim,
                            var_name,
                            shape[dim]
                        )));
                    }
                    axes.push(ci);
                }
                Some(_) => {
                    return Err(Error::InvalidData(format!(
                        "coordinate '{}' of '{}' follows a dimension without coordinate",
                        dim_name, var_name
                    )))
                }
                None => {}
            }
        }
        let grid = &shape[..axes.len()];

        let name = var_attr_text(&var_attrs, "param_name").unwrap_or_else(|| var_name.clone());
        params.push(ImportedParameter {
            row: ParameterRow {
                param_index: 0,
                param_id: m_param,
                nth_set,
                nth_dim: -1,
                param_id_m_param: m_param,
                setpoint: false,
                setpoint_local: false,
                name_global: Some(name.clone()),
                label: var_attr_text(&var_attrs, "long_name").unwrap_or_else(|| name.clone()),
                unit: var_attr_text(&var_attrs, "units").unwrap_or_default(),
                name,
                dependency: axes.iter().map(|ci| COORD_PARAM_ID_OFFSET + *ci as i64).collect(),
                shape: shape.clone(),
                write_cursor: 0,
                total_size: 0,
                oid: 0,
            },
            data,
        });

        for (dim, ci) in axes.iter().enumerate() {
            let param_id = COORD_PARAM_ID_OFFSET + *ci as i64;
            let recorded = params
                .iter()
                .any(|p| !p.row.is_measured() && p.row.param_id == param_id && p.row.param_id_m_param == m_param);
            if recorded {
                continue;
            }
            let coord = &coordinates[*ci];
            params.push(ImportedParameter {
                row: ParameterRow {
                    param_index: 0,
                    param_id,
                    nth_set: 0,
                    nth_dim: dim as i64,
                    param_id_m_param: m_param,
                    setpoint: true,
                    setpoint_local: false,
                    name_global: Some(coord.name.clone()),
                    name: coord.name.clone(),
                    label: coord.label.clone(),
                    unit: coord.unit.clone(),
                    dependency: Vec::new(),
                    shape: grid.to_vec(),
                    write_cursor: 0,
                    total_size: 0,
                    oid: 0,
                },
                data: broadcast(&coord.values, grid, dim),
            });
        }
    }
    debug!(
        "Labeled import of {}: {} coordinates, {} schema rows",
        uuid,
        coordinates.len(),
        params.len()
    );

    let overview = ImportedOverview {
        uuid,
        exp_name: require_str(attrs, "title")?.to_string(),
        triple,
        created_by: attr_str(attrs, "created_by")
            .map(str::to_string)
            .unwrap_or_else(current_account),
        start_time,
        stop_time,
        completed,
        starred: false,
        keywords,
        snapshot: decode_snapshot(attrs)?,
        metadata: json_attr(attrs, "metadata")?,
    };
    persist(catalog, overview, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time("1970-01-01 00:00:01.500000").unwrap(), 1.5);
        assert_eq!(parse_time("1970-01-01 00:01:00").unwrap(), 60.0);
        assert_eq!(parse_time("1970-01-01T00:00:02+00:00").unwrap(), 2.0);
        assert!(parse_time("yesterday").is_err());
        assert_eq!(format_time(1.5), "1970-01-01 00:00:01.500000");
    }

    #[test]
    fn test_flatten_nested() {
        let (shape, data) = flatten(&json!([[1, 2, 3], [4, null, 6]])).unwrap();
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(data[..4], [1.0, 2.0, 3.0, 4.0]);
        assert!(data[4].is_nan());
        assert!(flatten(&json!([[1, 2], [3]])).is_err());
        assert!(flatten(&json!([[1, 2], 3])).is_err());
        assert!(flatten(&json!([3, [1, 2]])).is_err());
    }

    #[test]
    fn test_broadcast_grid() {
        assert_eq!(broadcast(&[1.0, 2.0], &[2, 3], 0), vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert_eq!(broadcast(&[7.0, 8.0, 9.0], &[2, 3], 1), vec![7.0, 8.0, 9.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_duplicate_coordinates() {
        let mut coords = Map::new();
        let attrs = json!({"units": "mV", "long_name": "P1"});
        assert_eq!(add_coord(&mut coords, "P1", &[0.0, 1.0], attrs.clone()), "P1");
        assert_eq!(add_coord(&mut coords, "P1", &[0.0, 1.0], attrs.clone()), "P1");
        assert_eq!(add_coord(&mut coords, "P1", &[0.0, 2.0], attrs), "P1-1");
        assert_eq!(coords.len(), 2);
    }
}
