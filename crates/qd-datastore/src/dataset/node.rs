//! Parameter nodes: lazily transformed views over live parameter buffers.

use ndarray::ArrayD;

use crate::buffer::{BufferView, Selector, Transform};
use crate::error::{Error, Result};

/// What a node presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Measured,
    Setpoint,
}

/// One named array of a loaded dataset.
///
/// `axes` is aligned with the current dimensions of the node: entry `d` is the
/// setpoint node describing dimension `d`, or `None` for trailing dimensions
/// that have no setpoint (array-valued readings). Slicing and averaging keep
/// the two in step.
#[derive(Clone)]
pub struct ParameterNode {
    key: String,
    param_index: i64,
    name: String,
    label: String,
    unit: String,
    kind: NodeKind,
    view: BufferView,
    axes: Vec<Option<ParameterNode>>,
}

impl std::fmt::Debug for ParameterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterNode")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("label", &self.label)
            .field("unit", &self.unit)
            .field("kind", &self.kind)
            .field("transforms", &self.view.transforms())
            .finish()
    }
}

/// Letter used for dimension `dim` of an `ndim`-dimensional node.
pub fn axis_letter(dim: usize, ndim: usize) -> char {
    if ndim <= 3 {
        ['x', 'y', 'z'][dim.min(2)]
    } else {
        (b'i' + dim.min(17) as u8) as char
    }
}

impl ParameterNode {
    pub(crate) fn setpoint(
        key: String,
        param_index: i64,
        name: String,
        label: String,
        unit: String,
        view: BufferView,
        primary_axis: usize,
    ) -> Result<Self> {
        let view = view.with(Transform::SetpointAxis { axis: primary_axis })?;
        Ok(Self {
            key,
            param_index,
            name,
            label,
            unit,
            kind: NodeKind::Setpoint,
            view,
            axes: vec![None],
        })
    }

    pub(crate) fn measured(
        key: String,
        param_index: i64,
        name: String,
        label: String,
        unit: String,
        view: BufferView,
        axes: Vec<Option<ParameterNode>>,
    ) -> Result<Self> {
        let ndim = view.shape()?.len();
        let mut axes = axes;
        axes.resize(ndim, None);
        Ok(Self {
            key,
            param_index,
            name,
            label,
            unit,
            kind: NodeKind::Measured,
            view,
            axes,
        })
    }

    /// Lookup key inside the dataset (`m1`, `m1_2`, or the setpoint name).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn param_index(&self) -> i64 {
        self.param_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_setpoint(&self) -> bool {
        self.kind == NodeKind::Setpoint
    }

    pub fn transforms(&self) -> &[Transform] {
        self.view.transforms()
    }

    /// Current values: axis values for a setpoint node, measured values
    /// otherwise. Positions past the last synced cursor are NaN.
    pub fn data(&self) -> Result<ArrayD<f64>> {
        self.view.get()
    }

    pub fn shape(&self) -> Result<Vec<usize>> {
        self.view.shape()
    }

    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    /// Setpoint node of dimension `dim`.
    pub fn axis(&self, dim: usize) -> Result<&ParameterNode> {
        self.axes
            .get(dim)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::NotFound(format!("parameter '{}' has no setpoint for dimension {}", self.key, dim)))
    }

    /// Setpoint node by letter: `x`, `y`, `z`, or `i`, `j`, `k`, ... above
    /// three dimensions.
    pub fn axis_by_letter(&self, letter: char) -> Result<&ParameterNode> {
        let dim = self.dim_of_letter(letter)?;
        self.axis(dim)
    }

    fn dim_of_letter(&self, letter: char) -> Result<usize> {
        (0..self.ndim())
            .find(|dim| axis_letter(*dim, self.ndim()) == letter)
            .ok_or_else(|| Error::NotFound(format!("parameter '{}' has no axis '{}'", self.key, letter)))
    }

    pub fn x(&self) -> Result<&ParameterNode> {
        self.axis_by_letter('x')
    }

    pub fn y(&self) -> Result<&ParameterNode> {
        self.axis_by_letter('y')
    }

    pub fn z(&self) -> Result<&ParameterNode> {
        self.axis_by_letter('z')
    }

    /// Integer selectors drop `axis`; ranges narrow it together with its
    /// setpoint node.
    pub fn slice(&self, axis: usize, selector: Selector) -> Result<ParameterNode> {
        let view = self.view.with(Transform::Slice { axis, selector })?;
        let mut axes = self.axes.clone();
        match selector {
            Selector::Index(_) => {
                axes.remove(axis);
            }
            Selector::Range { .. } => {
                if let Some(Some(setpoint)) = axes.get(axis) {
                    let narrowed = setpoint.slice(0, selector)?;
                    axes[axis] = Some(narrowed);
                }
            }
            Selector::Full => {}
        }
        Ok(self.derive(view, axes))
    }

    pub fn average(&self, axis: usize) -> Result<ParameterNode> {
        let view = self.view.with(Transform::Average { axis })?;
        let mut axes = self.axes.clone();
        axes.remove(axis);
        Ok(self.derive(view, axes))
    }

    /// Averages over the axis named by `letter`.
    pub fn average_by(&self, letter: char) -> Result<ParameterNode> {
        let dim = self.dim_of_letter(letter)?;
        self.average(dim)
    }

    /// Applies one selector per leading dimension, left to right.
    pub fn index(&self, selectors: &[Selector]) -> Result<ParameterNode> {
        if selectors.len() > self.ndim() {
            return Err(Error::InvalidData(format!(
                "{} indices given for {}-dimensional parameter '{}'",
                selectors.len(),
                self.ndim(),
                self.key
            )));
        }
        let mut node = self.clone();
        let mut dim = 0;
        for selector in selectors {
            node = node.slice(dim, *selector)?;
            if !selector.drops_axis() {
                dim += 1;
            }
        }
        Ok(node)
    }

    fn derive(&self, view: BufferView, axes: Vec<Option<ParameterNode>>) -> ParameterNode {
        ParameterNode {
            key: self.key.clone(),
            param_index: self.param_index,
            name: self.name.clone(),
            label: self.label.clone(),
            unit: self.unit.clone(),
            kind: self.kind,
            view,
            axes,
        }
    }

    /// Iterates `(letter, setpoint)` over the dimensions that have one.
    pub fn setpoints(&self) -> impl Iterator<Item = (char, &ParameterNode)> + '_ {
        let ndim = self.ndim();
        self.axes
            .iter()
            .enumerate()
            .filter_map(move |(dim, axis)| axis.as_ref().map(|node| (axis_letter(dim, ndim), node)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStore;
    use crate::catalog::Catalog;
    use ndarray::{arr1, arr2};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        _catalog: Catalog,
        node: ParameterNode,
    }

    /// 3x4 measured grid with setpoints x = [0, 1, 2] and y = [10, 20, 30, 40].
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open_path(&dir.path().join("nodes.sqlite")).unwrap();
        let store = BufferStore::new(catalog.blobs.clone(), 16);

        let write = |values: Vec<f64>| {
            let mut writer = store.create(&[3, 4]).unwrap();
            writer.append(&values).unwrap();
            writer.flush().unwrap();
            let mut reader = store.reader(writer.handle(), &[3, 4]).unwrap();
            reader.sync_to(12).unwrap();
            BufferView::new(reader.into_shared())
        };
        let measured = write((1..=12).map(f64::from).collect());
        let xs = write((0..3).flat_map(|i| std::iter::repeat(f64::from(i)).take(4)).collect());
        let ys = write((0..3).flat_map(|_| [10.0, 20.0, 30.0, 40.0]).collect());

        let x = ParameterNode::setpoint("x".into(), 1, "x".into(), "gate".into(), "mV".into(), xs, 0).unwrap();
        let y = ParameterNode::setpoint("y".into(), 2, "y".into(), "freq".into(), "Hz".into(), ys, 1).unwrap();
        let node = ParameterNode::measured(
            "m1".into(),
            0,
            "I".into(),
            "current".into(),
            "nA".into(),
            measured,
            vec![Some(x), Some(y)],
        )
        .unwrap();
        Fixture {
            _dir: dir,
            _catalog: catalog,
            node,
        }
    }

    // ===== Axes =====

    #[test]
    fn test_axis_letters() {
        assert_eq!(axis_letter(0, 1), 'x');
        assert_eq!(axis_letter(2, 3), 'z');
        assert_eq!(axis_letter(0, 4), 'i');
        assert_eq!(axis_letter(3, 4), 'l');
    }

    #[test]
    fn test_setpoint_nodes_are_reduced() {
        let f = fixture();
        assert_eq!(f.node.ndim(), 2);
        assert_eq!(f.node.x().unwrap().data().unwrap(), arr1(&[0.0, 1.0, 2.0]).into_dyn());
        assert_eq!(
            f.node.y().unwrap().data().unwrap(),
            arr1(&[10.0, 20.0, 30.0, 40.0]).into_dyn()
        );
        assert_eq!(f.node.y().unwrap().unit(), "Hz");
        assert!(f.node.z().is_err());
        assert_eq!(f.node.setpoints().count(), 2);
    }

    // ===== Transforms =====

    #[test]
    fn test_index_drops_axis_and_setpoint() {
        let f = fixture();
        let row = f.node.index(&[Selector::Index(1)]).unwrap();
        assert_eq!(row.shape().unwrap(), vec![4]);
        assert_eq!(row.data().unwrap(), arr1(&[5.0, 6.0, 7.0, 8.0]).into_dyn());
        // the remaining axis is now x
        assert_eq!(row.x().unwrap().label(), "freq");
    }

    #[test]
    fn test_range_narrows_setpoint() {
        let f = fixture();
        let narrowed = f.node.slice(1, Selector::range(1, 3)).unwrap();
        assert_eq!(narrowed.shape().unwrap(), vec![3, 2]);
        assert_eq!(
            narrowed.data().unwrap(),
            arr2(&[[2.0, 3.0], [6.0, 7.0], [10.0, 11.0]]).into_dyn()
        );
        assert_eq!(narrowed.y().unwrap().data().unwrap(), arr1(&[20.0, 30.0]).into_dyn());
    }

    #[test]
    fn test_average_by_letter() {
        let f = fixture();
        let mean = f.node.average_by('y').unwrap();
        assert_eq!(mean.shape().unwrap(), vec![3]);
        assert_eq!(mean.data().unwrap(), arr1(&[2.5, 6.5, 10.5]).into_dyn());
        assert_eq!(mean.x().unwrap().label(), "gate");
    }

    #[test]
    fn test_mixed_tuple_index() {
        let f = fixture();
        let node = f
            .node
            .index(&[Selector::range(0, 2), Selector::Index(-1)])
            .unwrap();
        assert_eq!(node.data().unwrap(), arr1(&[4.0, 8.0]).into_dyn());
        assert!(f.node.index(&[Selector::Full; 3]).is_err());
    }

    #[test]
    fn test_views_share_source() {
        let f = fixture();
        let a = f.node.average(0).unwrap();
        let b = f.node.slice(0, Selector::Index(0)).unwrap();
        assert!(Arc::ptr_eq(a.view.source(), b.view.source()));
    }
}
