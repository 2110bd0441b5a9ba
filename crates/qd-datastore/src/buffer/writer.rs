use tracing::debug;

use crate::buffer::{check_shape, encode_samples, nan_bytes, SAMPLE_BYTES};
use crate::catalog::LargeObjectStore;
use crate::error::{Error, Result};

/// Single-writer append handle for one parameter blob.
///
/// Samples passed to [`append`](Self::append) stay in memory until
/// [`flush`](Self::flush); only flushed samples may be published as the
/// parameter's write cursor.
pub struct BufferWriter {
    blobs: LargeObjectStore,
    loid: i64,
    shape: Vec<usize>,
    total_size: usize,
    flushed: usize,
    allocated: usize,
    pending: Vec<f64>,
    prealloc_samples: usize,
    closed: bool,
}

impl BufferWriter {
    pub fn create(blobs: &LargeObjectStore, shape: &[usize], prealloc_samples: usize) -> Result<Self> {
        let total_size = check_shape(shape)?;
        let loid = blobs.create()?;
        debug!("Allocated blob {} for shape {:?}", loid, shape);
        Ok(Self {
            blobs: blobs.clone(),
            loid,
            shape: shape.to_vec(),
            total_size,
            flushed: 0,
            allocated: 0,
            pending: Vec::new(),
            prealloc_samples: prealloc_samples.max(1),
            closed: false,
        })
    }

    pub fn handle(&self) -> i64 {
        self.loid
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Samples accepted so far, flushed or not.
    pub fn cursor(&self) -> usize {
        self.flushed + self.pending.len()
    }

    pub fn flushed_cursor(&self) -> usize {
        self.flushed
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn append(&mut self, values: &[f64]) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidData(format!("blob {} is closed", self.loid)));
        }
        if self.cursor() + values.len() > self.total_size {
            return Err(Error::InvalidData(format!(
                "appending {} samples to blob {} overflows its size ({} of {} used)",
                values.len(),
                self.loid,
                self.cursor(),
                self.total_size
            )));
        }
        self.pending.extend_from_slice(values);
        Ok(())
    }

    /// Writes pending samples. When the data runs past the allocated region
    /// the blob is extended by a NaN page of `prealloc_samples` in the same
    /// write. Returns the flushed cursor.
    pub fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(self.flushed);
        }
        let end = self.flushed + self.pending.len();
        let mut bytes = encode_samples(&self.pending);
        if end > self.allocated {
            let target = (end + self.prealloc_samples).min(self.total_size).max(end);
            bytes.extend_from_slice(&nan_bytes(target - end));
            self.allocated = target;
        }
        self.blobs
            .write_at(self.loid, (self.flushed * SAMPLE_BYTES) as u64, &bytes)?;
        debug!(
            "Flushed {} samples to blob {} (cursor {} -> {})",
            self.pending.len(),
            self.loid,
            self.flushed,
            end
        );
        self.flushed = end;
        self.pending.clear();
        Ok(self.flushed)
    }

    /// Flushes, then backs every remaining slot with NaN and moves the cursor
    /// to the end of the array.
    pub fn seal(&mut self) -> Result<usize> {
        self.flush()?;
        if self.allocated < self.total_size {
            let conn = self.blobs.connection()?;
            crate::buffer::fill_nan_on(&conn, self.loid, self.allocated, self.total_size)?;
            self.allocated = self.total_size;
        }
        self.flushed = self.total_size;
        Ok(self.flushed)
    }

    /// Flushes and releases the writer; the blob stays in the catalog.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.pending = Vec::new();
        self.closed = true;
        Ok(())
    }
}
