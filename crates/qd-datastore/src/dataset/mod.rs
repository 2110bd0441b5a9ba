//! Datasets: the write-side lifecycle and the read-side object model.

pub mod loader;
pub mod node;
pub mod writer;

pub use loader::{load_by_id, load_by_uuid};
pub use node::{axis_letter, NodeKind, ParameterNode};
pub use writer::{
    generate_keywords, recover_interrupted, DatasetBuilder, DatasetWriter, ParameterRole, ParameterSpec,
    WriterState,
};

use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use tracing::debug;

use crate::buffer::SharedReader;
use crate::catalog::{Catalog, MeasurementRow, ParameterRow};
use crate::error::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Serializes a JSON document for a snapshot or metadata column.
pub fn encode_json_blob(value: &Value, compress: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    if !compress {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decodes a snapshot or metadata column, gzip-wrapped or plain.
pub fn decode_json_blob(bytes: &[u8]) -> Result<Value> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut json = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    } else {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn decode_optional(bytes: Option<&[u8]>) -> Result<Value> {
    match bytes {
        Some(bytes) if !bytes.is_empty() => decode_json_blob(bytes),
        _ => Ok(Value::Null),
    }
}

/// Converts catalog seconds-since-epoch into a UTC timestamp.
pub fn to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    let micros = (seconds * 1e6).round() as i64;
    DateTime::from_timestamp(micros.div_euclid(1_000_000), (micros.rem_euclid(1_000_000) * 1000) as u32)
}

/// A loaded dataset.
///
/// Parameter data is held in shared live readers; every node handed out by
/// [`node`](Self::node) sees the samples pulled in by [`sync`](Self::sync).
pub struct Dataset {
    catalog: Arc<Catalog>,
    overview: MeasurementRow,
    rows: Vec<ParameterRow>,
    readers: Vec<SharedReader>,
    nodes: Vec<ParameterNode>,
    snapshot: OnceLock<Value>,
    metadata: OnceLock<Value>,
}

impl Dataset {
    pub(crate) fn assemble(
        catalog: Arc<Catalog>,
        overview: MeasurementRow,
        rows: Vec<ParameterRow>,
        readers: Vec<SharedReader>,
        nodes: Vec<ParameterNode>,
    ) -> Self {
        Self {
            catalog,
            overview,
            rows,
            readers,
            nodes,
            snapshot: OnceLock::new(),
            metadata: OnceLock::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn overview(&self) -> &MeasurementRow {
        &self.overview
    }

    pub fn parameter_rows(&self) -> &[ParameterRow] {
        &self.rows
    }

    pub fn id(&self) -> i64 {
        self.overview.id
    }

    pub fn uuid(&self) -> i64 {
        self.overview.uuid
    }

    pub fn name(&self) -> &str {
        &self.overview.exp_name
    }

    pub fn project(&self) -> &str {
        &self.overview.project
    }

    pub fn setup(&self) -> &str {
        &self.overview.setup
    }

    pub fn sample(&self) -> &str {
        &self.overview.sample
    }

    pub fn created_by(&self) -> &str {
        &self.overview.created_by
    }

    pub fn run_timestamp(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.overview.start_time)
    }

    /// Stop time; equal to the run timestamp while the dataset is running.
    pub fn completed_timestamp(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.overview.effective_stop_time())
    }

    pub fn keywords(&self) -> &[String] {
        &self.overview.keywords
    }

    pub fn completed(&self) -> bool {
        self.overview.completed
    }

    pub fn starred(&self) -> bool {
        self.overview.starred
    }

    /// Instrument snapshot, decoded on first access. `Null` when absent.
    pub fn snapshot(&self) -> Result<&Value> {
        if let Some(value) = self.snapshot.get() {
            return Ok(value);
        }
        let value = decode_optional(self.overview.snapshot.as_deref())?;
        Ok(self.snapshot.get_or_init(|| value))
    }

    pub fn metadata(&self) -> Result<&Value> {
        if let Some(value) = self.metadata.get() {
            return Ok(value);
        }
        let value = decode_optional(self.overview.metadata.as_deref())?;
        Ok(self.metadata.get_or_init(|| value))
    }

    /// Full sample array of the schema row at `position`, NaN past its cursor.
    pub fn row_values(&self, position: usize) -> Result<Vec<f64>> {
        let reader = self.readers.get(position).ok_or_else(|| {
            Error::NotFound(format!("dataset {} has no parameter row {}", self.uuid(), position))
        })?;
        let guard = reader.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.data().iter().copied().collect())
    }

    /// Measured parameter nodes in schema order.
    pub fn nodes(&self) -> &[ParameterNode] {
        &self.nodes
    }

    /// Node `m{index}` (1-based). For grouped outputs this is the first of the group.
    pub fn m(&self, index: usize) -> Result<&ParameterNode> {
        self.node(&format!("m{}", index))
    }

    /// Finds a measured node by key (`m1`, `m2_1`), parameter name or label.
    pub fn node(&self, key: &str) -> Result<&ParameterNode> {
        if let Some(node) = self.nodes.iter().find(|n| n.key() == key) {
            return Ok(node);
        }
        if let Some(node) = self.nodes.iter().find(|n| n.key() == format!("{}_1", key)) {
            return Ok(node);
        }
        self.nodes
            .iter()
            .find(|n| n.name() == key)
            .or_else(|| self.nodes.iter().find(|n| n.label() == key))
            .ok_or_else(|| Error::NotFound(format!("dataset {} has no parameter '{}'", self.uuid(), key)))
    }

    /// Pulls newly committed samples into the live readers. Does nothing once
    /// the dataset is completed.
    pub fn sync(&mut self) -> Result<()> {
        if self.overview.completed {
            return Ok(());
        }
        let raw = self.catalog.get_dataset_raw(self.overview.uuid)?;
        for fresh in &raw.parameters {
            let position = self.rows.iter().position(|r| r.param_index == fresh.param_index);
            if let Some(idx) = position {
                let cursor = fresh.write_cursor.max(0) as usize;
                self.readers[idx]
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .sync_to(cursor)?;
                self.rows[idx].write_cursor = fresh.write_cursor;
            }
        }
        debug!(
            "Synced dataset {} (completed: {})",
            self.overview.uuid, raw.overview.completed
        );
        self.overview = raw.overview;
        Ok(())
    }
}

fn shape_text(shape: &[usize]) -> String {
    match shape {
        [single] => format!("({},)", single),
        _ => format!(
            "({})",
            shape.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", ")
        ),
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = |t: Option<DateTime<Utc>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default()
        };
        writeln!(f, "dataset :: {}", self.name())?;
        writeln!(f)?;
        writeln!(f, "id = {}", self.id())?;
        writeln!(f, "uuid = {}", self.uuid())?;
        writeln!(f)?;
        writeln!(f, "Measured on {}", time(self.run_timestamp()))?;
        writeln!(f, "Completed on {}", time(self.completed_timestamp()))?;
        writeln!(
            f,
            "Project {} - Setup {} - Sample {}",
            self.project(),
            self.setup(),
            self.sample()
        )?;
        if !self.keywords().is_empty() {
            writeln!(f, "Keywords: {}", self.keywords().join(", "))?;
        }
        writeln!(f)?;
        writeln!(f, "| idn | label | unit | size |")?;
        writeln!(f, "|-----|-------|------|------|")?;
        for node in &self.nodes {
            let shape = node.shape().map(|s| shape_text(&s)).unwrap_or_default();
            writeln!(f, "| {} | {} | {} | {} |", node.key(), node.label(), node.unit(), shape)?;
            for (letter, axis) in node.setpoints() {
                let shape = axis.shape().map(|s| shape_text(&s)).unwrap_or_default();
                writeln!(f, "|  {}  | {} | {} | {} |", letter, axis.label(), axis.unit(), shape)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ===== JSON blobs =====

    #[test]
    fn test_json_blob_gzip_and_plain() {
        let value = json!({"gates": {"P1": 12.5, "B0": -3}, "ok": true});
        let packed = encode_json_blob(&value, true).unwrap();
        assert_eq!(&packed[..2], &GZIP_MAGIC);
        assert_eq!(decode_json_blob(&packed).unwrap(), value);

        let plain = encode_json_blob(&value, false).unwrap();
        assert_eq!(plain[0], b'{');
        assert_eq!(decode_json_blob(&plain).unwrap(), value);
    }

    #[test]
    fn test_missing_blob_is_null() {
        assert_eq!(decode_optional(None).unwrap(), Value::Null);
        assert_eq!(decode_optional(Some(&[])).unwrap(), Value::Null);
        assert!(decode_json_blob(b"not json").is_err());
    }

    #[test]
    fn test_timestamps() {
        let t = to_datetime(1.5).unwrap();
        assert_eq!(t.timestamp(), 1);
        assert_eq!(t.timestamp_subsec_micros(), 500_000);
        assert_eq!(shape_text(&[5]), "(5,)");
        assert_eq!(shape_text(&[3, 4]), "(3, 4)");
    }
}
