use std::sync::{Arc, PoisonError, RwLock};

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use tracing::warn;

use crate::buffer::{check_shape, decode_samples, SAMPLE_BYTES};
use crate::catalog::LargeObjectStore;
use crate::error::{Error, Result};

/// Live copy of one parameter blob, shaped like the parameter.
pub struct BufferReader {
    blobs: LargeObjectStore,
    loid: i64,
    data: ArrayD<f64>,
    cursor: usize,
}

pub type SharedReader = Arc<RwLock<BufferReader>>;

impl BufferReader {
    pub fn open(blobs: &LargeObjectStore, loid: i64, shape: &[usize]) -> Result<Self> {
        check_shape(shape)?;
        Ok(Self {
            blobs: blobs.clone(),
            loid,
            data: ArrayD::from_elem(IxDyn(shape), f64::NAN),
            cursor: 0,
        })
    }

    pub fn into_shared(self) -> SharedReader {
        Arc::new(RwLock::new(self))
    }

    pub fn handle(&self) -> i64 {
        self.loid
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// Samples loaded so far through [`sync_to`](Self::sync_to).
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    /// Copies samples `[start, stop)` of the blob (to the end of the array
    /// when `stop` is `None`) into the local array at the same flat offset.
    /// Returns the number of samples the blob actually held.
    pub fn update_buffer(&mut self, start: usize, stop: Option<usize>) -> Result<usize> {
        let total = self.data.len();
        let stop = stop.unwrap_or(total).min(total);
        if start >= stop {
            return Ok(0);
        }
        let bytes = self.blobs.read_at(
            self.loid,
            (start * SAMPLE_BYTES) as u64,
            (stop - start) * SAMPLE_BYTES,
        )?;
        let values = decode_samples(&bytes);
        for (slot, value) in self.data.iter_mut().skip(start).zip(values.iter()) {
            *slot = *value;
        }
        Ok(values.len())
    }

    /// Extends the local copy to `cursor`, reading only the unseen tail.
    pub fn sync_to(&mut self, cursor: usize) -> Result<()> {
        let cursor = cursor.min(self.data.len());
        if cursor > self.cursor {
            self.update_buffer(self.cursor, Some(cursor))?;
            self.cursor = cursor;
        }
        Ok(())
    }
}

/// Index selector along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Picks one position and drops the axis. Negative values count from the end.
    Index(isize),
    /// Keeps `start..end` (Python-style bounds, clipped) with a positive step.
    Range {
        start: Option<isize>,
        end: Option<isize>,
        step: usize,
    },
    /// Keeps the whole axis.
    Full,
}

impl Selector {
    pub fn range(start: isize, end: isize) -> Self {
        Selector::Range {
            start: Some(start),
            end: Some(end),
            step: 1,
        }
    }

    pub fn drops_axis(&self) -> bool {
        matches!(self, Selector::Index(_))
    }
}

/// Lazy operation applied to a buffer when it is read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Slice { axis: usize, selector: Selector },
    Average { axis: usize },
    /// Reduces a setpoint grid to its 1-D axis: the lane along `axis` at
    /// index 0 of every other axis.
    SetpointAxis { axis: usize },
}

fn resolve_bound(value: isize, len: usize) -> usize {
    if value < 0 {
        (len as isize + value).max(0) as usize
    } else {
        (value as usize).min(len)
    }
}

fn check_axis(axis: usize, shape: &[usize]) -> Result<()> {
    if axis >= shape.len() {
        return Err(Error::InvalidData(format!(
            "axis {} out of range for shape {:?}",
            axis, shape
        )));
    }
    Ok(())
}

fn resolve_index(index: isize, len: usize) -> Result<usize> {
    let resolved = if index < 0 { len as isize + index } else { index };
    if resolved < 0 || resolved as usize >= len {
        return Err(Error::InvalidData(format!(
            "index {} out of range for axis of length {}",
            index, len
        )));
    }
    Ok(resolved as usize)
}

fn range_bounds(start: Option<isize>, end: Option<isize>, step: usize, len: usize) -> Result<(usize, usize)> {
    if step == 0 {
        return Err(Error::InvalidData("slice step must be positive".into()));
    }
    let start = start.map(|s| resolve_bound(s, len)).unwrap_or(0);
    let end = end.map(|e| resolve_bound(e, len)).unwrap_or(len).max(start);
    Ok((start, end))
}

impl Transform {
    /// Shape produced by applying this transform to an array of `shape`.
    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        let mut out = shape.to_vec();
        match *self {
            Transform::Slice { axis, selector } => {
                check_axis(axis, shape)?;
                match selector {
                    Selector::Index(index) => {
                        resolve_index(index, shape[axis])?;
                        out.remove(axis);
                    }
                    Selector::Range { start, end, step } => {
                        let (start, end) = range_bounds(start, end, step, shape[axis])?;
                        out[axis] = (end - start + step - 1) / step;
                    }
                    Selector::Full => {}
                }
            }
            Transform::Average { axis } => {
                check_axis(axis, shape)?;
                out.remove(axis);
            }
            Transform::SetpointAxis { axis } => {
                check_axis(axis, shape)?;
                out = vec![shape[axis]];
            }
        }
        Ok(out)
    }

    pub fn apply(&self, data: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        match *self {
            Transform::Slice { axis, selector } => {
                check_axis(axis, data.shape())?;
                let len = data.len_of(Axis(axis));
                match selector {
                    Selector::Index(index) => {
                        let index = resolve_index(index, len)?;
                        Ok(data.index_axis(Axis(axis), index).to_owned())
                    }
                    Selector::Range { start, end, step } => {
                        let (start, end) = range_bounds(start, end, step, len)?;
                        let slice = Slice::new(start as isize, Some(end as isize), step as isize);
                        Ok(data.slice_axis(Axis(axis), slice).to_owned())
                    }
                    Selector::Full => Ok(data.clone()),
                }
            }
            Transform::Average { axis } => {
                check_axis(axis, data.shape())?;
                match data.mean_axis(Axis(axis)) {
                    Some(mean) => Ok(mean),
                    None => {
                        let shape = self.output_shape(data.shape())?;
                        Ok(ArrayD::from_elem(IxDyn(&shape), f64::NAN))
                    }
                }
            }
            Transform::SetpointAxis { axis } => {
                check_axis(axis, data.shape())?;
                Ok(setpoint_axis(data, axis))
            }
        }
    }
}

fn setpoint_axis(data: &ArrayD<f64>, axis: usize) -> ArrayD<f64> {
    if data.ndim() == 1 {
        return data.clone();
    }
    if data.is_empty() {
        return ArrayD::from_elem(IxDyn(&[data.len_of(Axis(axis))]), f64::NAN);
    }
    let mut slab = data.view();
    for other in (0..data.ndim()).rev().filter(|other| *other != axis) {
        slab = slab.index_axis_move(Axis(other), 0);
    }
    let varies = data.lanes(Axis(axis)).into_iter().any(|lane| {
        lane.iter()
            .zip(slab.iter())
            .any(|(a, b)| !a.is_nan() && !b.is_nan() && a != b)
    });
    if varies {
        warn!(
            "Setpoint values vary along axes orthogonal to axis {}; using the slab at index 0",
            axis
        );
    }
    slab.to_owned()
}

/// Applies `transforms` in order.
pub fn apply_all(data: &ArrayD<f64>, transforms: &[Transform]) -> Result<ArrayD<f64>> {
    let mut current = data.clone();
    for transform in transforms {
        current = transform.apply(&current)?;
    }
    Ok(current)
}

/// Read-only view over a shared live reader. The transforms are re-applied
/// on every access, so data synced into the reader shows through.
#[derive(Clone)]
pub struct BufferView {
    source: SharedReader,
    transforms: Vec<Transform>,
}

impl BufferView {
    pub fn new(source: SharedReader) -> Self {
        Self {
            source,
            transforms: Vec::new(),
        }
    }

    pub fn source(&self) -> &SharedReader {
        &self.source
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn with(&self, transform: Transform) -> Result<Self> {
        self.shape().and_then(|shape| transform.output_shape(&shape))?;
        let mut transforms = self.transforms.clone();
        transforms.push(transform);
        Ok(Self {
            source: Arc::clone(&self.source),
            transforms,
        })
    }

    /// View with the first axis fixed at `index`.
    pub fn slice_lambda(&self, index: isize) -> Result<Self> {
        self.with(Transform::Slice {
            axis: 0,
            selector: Selector::Index(index),
        })
    }

    /// View averaged over `axis`.
    pub fn averaging_lambda(&self, axis: usize) -> Result<Self> {
        self.with(Transform::Average { axis })
    }

    pub fn shape(&self) -> Result<Vec<usize>> {
        let reader = self.source.read().unwrap_or_else(PoisonError::into_inner);
        let mut shape = reader.shape().to_vec();
        for transform in &self.transforms {
            shape = transform.output_shape(&shape)?;
        }
        Ok(shape)
    }

    pub fn get(&self) -> Result<ArrayD<f64>> {
        let reader = self.source.read().unwrap_or_else(PoisonError::into_inner);
        apply_all(reader.data(), &self.transforms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStore;
    use crate::catalog::Catalog;
    use ndarray::{arr1, arr2, ArrayD};
    use tempfile::TempDir;

    fn grid() -> ArrayD<f64> {
        arr2(&[[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0], [9.0, 10.0, 11.0, 12.0]]).into_dyn()
    }

    // ===== Transforms =====

    #[test]
    fn test_index_drops_axis() {
        let t = Transform::Slice {
            axis: 0,
            selector: Selector::Index(1),
        };
        assert_eq!(t.output_shape(&[3, 4]).unwrap(), vec![4]);
        assert_eq!(t.apply(&grid()).unwrap(), arr1(&[5.0, 6.0, 7.0, 8.0]).into_dyn());

        let last = Transform::Slice {
            axis: 1,
            selector: Selector::Index(-1),
        };
        assert_eq!(last.apply(&grid()).unwrap(), arr1(&[4.0, 8.0, 12.0]).into_dyn());
    }

    #[test]
    fn test_range_narrows_axis() {
        let t = Transform::Slice {
            axis: 1,
            selector: Selector::range(1, 3),
        };
        assert_eq!(t.output_shape(&[3, 4]).unwrap(), vec![3, 2]);
        assert_eq!(
            t.apply(&grid()).unwrap(),
            arr2(&[[2.0, 3.0], [6.0, 7.0], [10.0, 11.0]]).into_dyn()
        );

        let stepped = Transform::Slice {
            axis: 1,
            selector: Selector::Range {
                start: None,
                end: Some(100),
                step: 2,
            },
        };
        assert_eq!(stepped.output_shape(&[3, 4]).unwrap(), vec![3, 2]);
        assert_eq!(stepped.apply(&grid()).unwrap().shape(), &[3, 2]);
    }

    #[test]
    fn test_average_drops_axis() {
        let t = Transform::Average { axis: 1 };
        assert_eq!(t.output_shape(&[3, 4]).unwrap(), vec![3]);
        assert_eq!(t.apply(&grid()).unwrap(), arr1(&[2.5, 6.5, 10.5]).into_dyn());
    }

    #[test]
    fn test_setpoint_axis_reduction() {
        // x varies along axis 0, constant along axis 1
        let x = arr2(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]).into_dyn();
        let t = Transform::SetpointAxis { axis: 0 };
        assert_eq!(t.output_shape(&[3, 2]).unwrap(), vec![3]);
        assert_eq!(t.apply(&x).unwrap(), arr1(&[0.0, 1.0, 2.0]).into_dyn());

        let y = arr2(&[[5.0, 6.0], [5.0, 6.0], [5.0, 6.0]]).into_dyn();
        let t = Transform::SetpointAxis { axis: 1 };
        assert_eq!(t.apply(&y).unwrap(), arr1(&[5.0, 6.0]).into_dyn());

        // alternating sweep direction still yields the first slab
        let zigzag = arr2(&[[5.0, 6.0], [6.0, 5.0]]).into_dyn();
        assert_eq!(t.apply(&zigzag).unwrap(), arr1(&[5.0, 6.0]).into_dyn());
    }

    #[test]
    fn test_invalid_transforms() {
        let bad_axis = Transform::Average { axis: 2 };
        assert!(bad_axis.output_shape(&[3, 4]).is_err());
        let bad_index = Transform::Slice {
            axis: 0,
            selector: Selector::Index(3),
        };
        assert!(bad_index.apply(&grid()).is_err());
        let zero_step = Transform::Slice {
            axis: 0,
            selector: Selector::Range {
                start: None,
                end: None,
                step: 0,
            },
        };
        assert!(zero_step.output_shape(&[3, 4]).is_err());
    }

    // ===== Live reads =====

    #[test]
    fn test_reader_follows_cursor() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&dir.path().join("reader.sqlite")).unwrap();
        let store = BufferStore::new(catalog.blobs.clone(), 100);
        let mut writer = store.create(&[5]).unwrap();
        let mut reader = store.reader(writer.handle(), &[5]).unwrap();

        writer.append(&[0.1, 0.2]).unwrap();
        writer.flush().unwrap();
        reader.sync_to(2).unwrap();
        let data = reader.data().as_slice().unwrap().to_vec();
        assert_eq!(&data[..2], &[0.1, 0.2]);
        assert!(data[2..].iter().all(|v| v.is_nan()));

        writer.append(&[0.3, 0.4, 0.5]).unwrap();
        writer.flush().unwrap();
        reader.sync_to(5).unwrap();
        assert_eq!(reader.cursor(), 5);
        assert_eq!(reader.data().as_slice().unwrap(), &[0.1, 0.2, 0.3, 0.4, 0.5]);
    }

    #[test]
    fn test_views_observe_new_data() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&dir.path().join("views.sqlite")).unwrap();
        let store = BufferStore::new(catalog.blobs.clone(), 100);
        let mut writer = store.create(&[2, 2]).unwrap();
        let shared = store.reader(writer.handle(), &[2, 2]).unwrap().into_shared();
        let row = BufferView::new(Arc::clone(&shared)).slice_lambda(1).unwrap();
        let mean = BufferView::new(Arc::clone(&shared)).averaging_lambda(0).unwrap();
        assert!(row.get().unwrap().iter().all(|v| v.is_nan()));

        writer.append(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        writer.flush().unwrap();
        shared.write().unwrap().sync_to(4).unwrap();
        assert_eq!(row.get().unwrap(), arr1(&[3.0, 4.0]).into_dyn());
        assert_eq!(mean.get().unwrap(), arr1(&[2.0, 3.0]).into_dyn());
        assert_eq!(mean.shape().unwrap(), vec![2]);
    }
}
