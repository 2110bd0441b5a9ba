//! Buffer store: one blob of little-endian f64 samples per parameter.
//!
//! Writers append into a blob that is pre-filled with NaN in coarse pages
//! ahead of the published cursor; readers copy the blob into a shaped array
//! and re-read only the tail past their last cursor.

pub mod reader;
pub mod writer;

pub use reader::{BufferReader, BufferView, Selector, SharedReader, Transform};
pub use writer::BufferWriter;

use rusqlite::Connection;

use crate::catalog::large_object::{lo_write, LargeObjectStore};
use crate::error::{Error, Result};

pub const SAMPLE_BYTES: usize = 8;

/// Upper bound on a single NaN fill write, in samples.
const NAN_FILL_CHUNK: usize = 125_000;

pub fn encode_samples(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * SAMPLE_BYTES);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decodes whole samples; a trailing partial sample is ignored.
pub fn decode_samples(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|chunk| {
            let mut raw = [0u8; SAMPLE_BYTES];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect()
}

pub fn nan_bytes(count: usize) -> Vec<u8> {
    f64::NAN.to_le_bytes().repeat(count)
}

pub(crate) fn check_shape(shape: &[usize]) -> Result<usize> {
    if shape.is_empty() {
        return Err(Error::InvalidData("buffer shape must have at least one axis".into()));
    }
    Ok(shape.iter().product())
}

/// Fills samples `[from, to)` of a blob with NaN.
pub(crate) fn fill_nan_on(conn: &Connection, loid: i64, from: usize, to: usize) -> Result<()> {
    let mut start = from;
    while start < to {
        let end = to.min(start + NAN_FILL_CHUNK);
        lo_write(conn, loid, (start * SAMPLE_BYTES) as u64, &nan_bytes(end - start))?;
        start = end;
    }
    Ok(())
}

/// Handle-level access to sample blobs.
#[derive(Clone)]
pub struct BufferStore {
    blobs: LargeObjectStore,
    prealloc_samples: usize,
}

impl BufferStore {
    pub fn new(blobs: LargeObjectStore, prealloc_samples: usize) -> Self {
        Self {
            blobs,
            prealloc_samples: prealloc_samples.max(1),
        }
    }

    /// Allocates an empty blob for an array of `shape` and returns its writer.
    pub fn create(&self, shape: &[usize]) -> Result<BufferWriter> {
        BufferWriter::create(&self.blobs, shape, self.prealloc_samples)
    }

    /// Reads `count` samples starting at sample `offset`. Positions the
    /// writer has not reached read as NaN.
    pub fn read(&self, loid: i64, offset: usize, count: usize) -> Result<Vec<f64>> {
        let bytes = self
            .blobs
            .read_at(loid, (offset * SAMPLE_BYTES) as u64, count * SAMPLE_BYTES)?;
        let mut values = decode_samples(&bytes);
        values.resize(count, f64::NAN);
        Ok(values)
    }

    pub fn reader(&self, loid: i64, shape: &[usize]) -> Result<BufferReader> {
        BufferReader::open(&self.blobs, loid, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use tempfile::TempDir;

    fn test_store(prealloc: usize) -> (TempDir, Catalog, BufferStore) {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&dir.path().join("buffers.sqlite")).unwrap();
        let store = BufferStore::new(catalog.blobs.clone(), prealloc);
        (dir, catalog, store)
    }

    #[test]
    fn test_sample_codec() {
        let values = [0.0, -1.5, f64::INFINITY, 1e-300];
        let bytes = encode_samples(&values);
        assert_eq!(bytes.len(), 32);
        assert_eq!(decode_samples(&bytes), values.to_vec());
        assert_eq!(decode_samples(&bytes[..13]).len(), 1);
        assert!(decode_samples(&nan_bytes(3)).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_read_past_cursor_is_nan() {
        let (_dir, _catalog, store) = test_store(2);
        let mut writer = store.create(&[10]).unwrap();
        writer.append(&[1.0, 2.0, 3.0]).unwrap();
        writer.flush().unwrap();

        let values = store.read(writer.handle(), 0, 10).unwrap();
        assert_eq!(&values[..3], &[1.0, 2.0, 3.0]);
        assert!(values[3..].iter().all(|v| v.is_nan()));
        assert_eq!(store.read(writer.handle(), 1, 1).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_empty_shape_rejected() {
        let (_dir, _catalog, store) = test_store(2);
        assert!(matches!(store.create(&[]), Err(Error::InvalidData(_))));
    }
}
