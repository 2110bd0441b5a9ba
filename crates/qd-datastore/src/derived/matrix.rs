//! Named coefficient matrices mapping real control channels onto virtual
//! ones. Only the canonical form is stored; inversion and normalization are
//! views computed on read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use tracing::{debug, info};

use crate::catalog::{Catalog, MatrixRecord};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Inverted,
    Normalized,
}

impl Conversion {
    fn forward(self, matrix: &Array2<f64>) -> Result<Array2<f64>> {
        match self {
            Self::Inverted => invert(matrix),
            Self::Normalized => normalize(matrix),
        }
    }

    fn backward(self, matrix: &Array2<f64>) -> Result<Array2<f64>> {
        match self {
            Self::Inverted => invert(matrix),
            Self::Normalized => denormalize(matrix),
        }
    }
}

/// Gauss-Jordan inversion with partial pivoting.
pub fn invert(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return Err(Error::InvalidData(format!(
            "cannot invert a {}x{} matrix",
            n,
            matrix.ncols()
        )));
    }
    let mut work = matrix.clone();
    let mut inverse = Array2::<f64>::eye(n);
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&a, &b| work[[a, col]].abs().total_cmp(&work[[b, col]].abs()))
            .unwrap_or(col);
        if work[[pivot, col]].abs() < 1e-12 {
            return Err(Error::InvalidData("matrix is singular".into()));
        }
        if pivot != col {
            for k in 0..n {
                work.swap([pivot, k], [col, k]);
                inverse.swap([pivot, k], [col, k]);
            }
        }
        let scale = work[[col, col]];
        for k in 0..n {
            work[[col, k]] /= scale;
            inverse[[col, k]] /= scale;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = work[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                work[[row, k]] -= factor * work[[col, k]];
                inverse[[row, k]] -= factor * inverse[[col, k]];
            }
        }
    }
    Ok(inverse)
}

/// Divides each row by the sum of its absolute values.
pub fn normalize(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let mut out = matrix.clone();
    for (i, mut row) in out.rows_mut().into_iter().enumerate() {
        let norm: f64 = row.iter().map(|v| v.abs()).sum();
        if norm == 0.0 {
            return Err(Error::InvalidData(format!("row {} is all zeros", i)));
        }
        row.mapv_inplace(|v| v / norm);
    }
    Ok(out)
}

/// Divides each row by its diagonal element.
pub fn denormalize(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let mut out = matrix.clone();
    for (i, mut row) in out.rows_mut().into_iter().enumerate() {
        let diagonal = row.get(i).copied().unwrap_or(0.0);
        if diagonal == 0.0 {
            return Err(Error::InvalidData(format!("row {} has a zero diagonal", i)));
        }
        row.mapv_inplace(|v| v / diagonal);
    }
    Ok(out)
}

fn to_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn from_rows(rows: &[Vec<f64>], n: usize) -> Result<Array2<f64>> {
    if rows.len() != n || rows.iter().any(|row| row.len() != n) {
        return Err(Error::InvalidData(format!(
            "stored matrix is not {}x{}",
            n, n
        )));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((n, n), flat).map_err(|e| Error::InvalidData(e.to_string()))
}

/// Merges `current` into the stored record: stored names keep their place,
/// names only in `current` are appended, and every coefficient between two
/// names of `current` takes the current value.
fn merge(stored: Option<MatrixRecord>, current: &DerivedMatrix) -> Result<MatrixRecord> {
    let Some(stored) = stored else {
        return Ok(MatrixRecord {
            name: current.name.clone(),
            real_names: current.real_names.clone(),
            virtual_names: current.virtual_names.clone(),
            matrix: to_rows(&current.matrix),
        });
    };
    let stored_matrix = from_rows(&stored.matrix, stored.real_names.len())?;

    let mut real_names = stored.real_names.clone();
    let mut virtual_names = stored.virtual_names.clone();
    virtual_names.resize_with(real_names.len(), String::new);
    for (i, name) in current.real_names.iter().enumerate() {
        match real_names.iter().position(|n| n == name) {
            Some(pos) => virtual_names[pos] = current.virtual_names[i].clone(),
            None => {
                real_names.push(name.clone());
                virtual_names.push(current.virtual_names[i].clone());
            }
        }
    }

    let n = real_names.len();
    let mut merged = Array2::<f64>::eye(n);
    for i in 0..stored_matrix.nrows() {
        for j in 0..stored_matrix.ncols() {
            merged[[i, j]] = stored_matrix[[i, j]];
        }
    }
    let index: Vec<usize> = current
        .real_names
        .iter()
        .filter_map(|name| real_names.iter().position(|n| n == name))
        .collect();
    for (i, &row) in index.iter().enumerate() {
        for (j, &col) in index.iter().enumerate() {
            merged[[row, col]] = current.matrix[[i, j]];
        }
    }

    Ok(MatrixRecord {
        name: current.name.clone(),
        real_names,
        virtual_names,
        matrix: to_rows(&merged),
    })
}

/// Handle on one persisted matrix, restricted to the names it was loaded with.
pub struct DerivedMatrix {
    catalog: Arc<Catalog>,
    name: String,
    real_names: Vec<String>,
    virtual_names: Vec<String>,
    matrix: Array2<f64>,
    last_update: DateTime<Utc>,
}

impl std::fmt::Debug for DerivedMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedMatrix")
            .field("name", &self.name)
            .field("real_names", &self.real_names)
            .field("virtual_names", &self.virtual_names)
            .field("matrix", &self.matrix)
            .field("last_update", &self.last_update)
            .finish()
    }
}

impl DerivedMatrix {
    /// Loads `name` restricted to `real_names`, creating or extending the
    /// stored matrix as needed, and persists the merged result.
    ///
    /// Coefficients between names already stored win over `matrix`; new names
    /// start from `matrix` (identity when absent).
    pub fn load(
        catalog: Arc<Catalog>,
        name: &str,
        real_names: &[&str],
        virtual_names: Option<&[&str]>,
        matrix: Option<Array2<f64>>,
    ) -> Result<Self> {
        let n = real_names.len();
        let real_names: Vec<String> = real_names.iter().map(|s| s.to_string()).collect();
        let virtual_names: Vec<String> = match virtual_names {
            Some(names) if names.len() == n => names.iter().map(|s| s.to_string()).collect(),
            Some(names) => {
                return Err(Error::InvalidData(format!(
                    "{} virtual names for {} real names",
                    names.len(),
                    n
                )))
            }
            None => real_names.iter().map(|s| format!("v{}", s)).collect(),
        };
        let mut values = match matrix {
            Some(m) if m.dim() == (n, n) => m,
            Some(m) => {
                return Err(Error::InvalidData(format!(
                    "matrix is {}x{}, expected {}x{}",
                    m.nrows(),
                    m.ncols(),
                    n,
                    n
                )))
            }
            None => Array2::eye(n),
        };

        if let Some(stored) = catalog.matrices.load_matrix(name)? {
            let stored_matrix = from_rows(&stored.matrix, stored.real_names.len())?;
            let positions: Vec<Option<usize>> = real_names
                .iter()
                .map(|r| stored.real_names.iter().position(|s| s == r))
                .collect();
            for (i, pi) in positions.iter().enumerate() {
                for (j, pj) in positions.iter().enumerate() {
                    if let (Some(pi), Some(pj)) = (pi, pj) {
                        values[[i, j]] = stored_matrix[[*pi, *pj]];
                    }
                }
            }
            debug!("Merged derived matrix '{}' with {} stored names", name, stored.real_names.len());
        }

        let handle = Self {
            catalog,
            name: name.to_string(),
            real_names,
            virtual_names,
            matrix: values,
            last_update: Utc::now(),
        };
        handle.save()?;
        info!("Loaded derived matrix '{}' ({}x{})", handle.name, n, n);
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn real_names(&self) -> &[String] {
        &self.real_names
    }

    pub fn virtual_names(&self) -> &[String] {
        &self.virtual_names
    }

    /// The canonical coefficients.
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    fn save(&self) -> Result<()> {
        let stored = self.catalog.matrices.load_matrix(&self.name)?;
        let record = merge(stored, self)?;
        self.catalog.matrices.save_matrix(&record)
    }

    /// Row by virtual (or real) name, column by real name.
    fn position(&self, row: &str, col: &str) -> Result<(usize, usize)> {
        let i = self
            .virtual_names
            .iter()
            .position(|n| n == row)
            .or_else(|| self.real_names.iter().position(|n| n == row))
            .ok_or_else(|| Error::NotFound(format!("matrix '{}' has no row '{}'", self.name, row)))?;
        let j = self
            .real_names
            .iter()
            .position(|n| n == col)
            .ok_or_else(|| Error::NotFound(format!("matrix '{}' has no column '{}'", self.name, col)))?;
        Ok((i, j))
    }

    fn check_bounds(&self, i: usize, j: usize) -> Result<()> {
        let n = self.real_names.len();
        if i >= n || j >= n {
            return Err(Error::NotFound(format!(
                "index ({}, {}) out of range for {}x{} matrix '{}'",
                i, j, n, n, self.name
            )));
        }
        Ok(())
    }

    pub fn get(&self, row: &str, col: &str) -> Result<f64> {
        let (i, j) = self.position(row, col)?;
        Ok(self.matrix[[i, j]])
    }

    pub fn get_at(&self, i: usize, j: usize) -> Result<f64> {
        self.check_bounds(i, j)?;
        Ok(self.matrix[[i, j]])
    }

    pub fn set(&mut self, row: &str, col: &str, value: f64) -> Result<()> {
        let (i, j) = self.position(row, col)?;
        self.set_at(i, j, value)
    }

    /// Writes one coefficient and persists the matrix. Last writer wins.
    pub fn set_at(&mut self, i: usize, j: usize, value: f64) -> Result<()> {
        self.check_bounds(i, j)?;
        self.matrix[[i, j]] = value;
        self.replace(self.matrix.clone())
    }

    fn replace(&mut self, matrix: Array2<f64>) -> Result<()> {
        self.matrix = matrix;
        self.save()?;
        self.last_update = Utc::now();
        Ok(())
    }

    /// A view applying `conversions` in order on read.
    pub fn view(&mut self, conversions: &[Conversion]) -> MatrixView<'_> {
        MatrixView {
            handle: self,
            conversions: conversions.to_vec(),
        }
    }
}

/// Converted window onto a [`DerivedMatrix`]. Writes go back through the
/// inverse conversions and store the canonical matrix.
pub struct MatrixView<'a> {
    handle: &'a mut DerivedMatrix,
    conversions: Vec<Conversion>,
}

impl MatrixView<'_> {
    pub fn matrix(&self) -> Result<Array2<f64>> {
        let mut out = self.handle.matrix.clone();
        for conversion in &self.conversions {
            out = conversion.forward(&out)?;
        }
        Ok(out)
    }

    pub fn get(&self, row: &str, col: &str) -> Result<f64> {
        let (i, j) = self.handle.position(row, col)?;
        Ok(self.matrix()?[[i, j]])
    }

    pub fn set(&mut self, row: &str, col: &str, value: f64) -> Result<()> {
        let (i, j) = self.handle.position(row, col)?;
        let mut converted = self.matrix()?;
        converted[[i, j]] = value;
        for conversion in self.conversions.iter().rev() {
            converted = conversion.backward(&converted)?;
        }
        self.handle.replace(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use tempfile::TempDir;

    fn catalog(dir: &TempDir) -> Arc<Catalog> {
        Arc::new(Catalog::open_path(&dir.path().join("matrices.sqlite")).unwrap())
    }

    fn close(a: &Array2<f64>, b: &Array2<f64>) -> bool {
        a.dim() == b.dim() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    // ===== Pure conversions =====

    #[test]
    fn test_invert() {
        let m = arr2(&[[2.0, 1.0], [1.0, 3.0]]);
        let inv = invert(&m).unwrap();
        assert!(close(&m.dot(&inv), &Array2::eye(2)));
        assert!(invert(&arr2(&[[1.0, 2.0], [2.0, 4.0]])).is_err());
    }

    #[test]
    fn test_invert_needs_pivoting() {
        let m = arr2(&[[0.0, 1.0], [1.0, 0.0]]);
        assert!(close(&invert(&m).unwrap(), &m));
    }

    #[test]
    fn test_normalize_and_back() {
        let m = arr2(&[[1.0, -0.5], [0.25, 1.0]]);
        let norm = normalize(&m).unwrap();
        for row in norm.rows() {
            assert!((row.iter().map(|v| v.abs()).sum::<f64>() - 1.0).abs() < 1e-12);
        }
        assert!(close(&denormalize(&norm).unwrap(), &m));
        assert!(normalize(&arr2(&[[0.0, 0.0], [0.0, 1.0]])).is_err());
    }

    // ===== Handle =====

    #[test]
    fn test_default_virtual_names_and_identity() {
        let dir = TempDir::new().unwrap();
        let m = DerivedMatrix::load(catalog(&dir), "vg", &["P1", "P2"], None, None).unwrap();
        assert_eq!(m.virtual_names(), &["vP1".to_string(), "vP2".to_string()]);
        assert!(close(m.matrix(), &Array2::eye(2)));
    }

    #[test]
    fn test_debug_lists_names() {
        let dir = TempDir::new().unwrap();
        let m = DerivedMatrix::load(catalog(&dir), "vg", &["P1", "P2"], None, None).unwrap();
        let text = format!("{:?}", m);
        assert!(text.starts_with("DerivedMatrix"));
        assert!(text.contains("\"vP2\""));
        assert!(!text.contains("catalog"));
    }

    #[test]
    fn test_set_persists() {
        let dir = TempDir::new().unwrap();
        let cat = catalog(&dir);
        let mut m = DerivedMatrix::load(cat.clone(), "vg", &["P1", "P2"], None, None).unwrap();
        let before = m.last_update();
        m.set("vP1", "P2", 0.3).unwrap();
        assert!(m.last_update() >= before);
        assert_eq!(m.get_at(0, 1).unwrap(), 0.3);
        assert!(m.get("vP3", "P1").unwrap_err().is_not_found());
        assert!(m.get_at(2, 0).is_err());

        let again = DerivedMatrix::load(cat, "vg", &["P1", "P2"], None, None).unwrap();
        assert_eq!(again.get("P1", "P2").unwrap(), 0.3);
    }

    #[test]
    fn test_inverted_view_writes_canonical() {
        let dir = TempDir::new().unwrap();
        let cat = catalog(&dir);
        let start = arr2(&[[1.0, 0.5], [0.0, 1.0]]);
        let mut m = DerivedMatrix::load(cat.clone(), "vg", &["P1", "P2"], None, Some(start.clone())).unwrap();
        {
            let mut view = m.view(&[Conversion::Inverted]);
            assert!((view.get("vP1", "P2").unwrap() + 0.5).abs() < 1e-12);
            view.set("vP1", "P2", -0.25).unwrap();
        }
        assert!(close(m.matrix(), &arr2(&[[1.0, 0.25], [0.0, 1.0]])));
        let stored = cat.matrices.load_matrix("vg").unwrap().unwrap();
        assert_eq!(stored.matrix, vec![vec![1.0, 0.25], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let err = DerivedMatrix::load(catalog(&dir), "vg", &["P1", "P2"], None, Some(Array2::eye(3)));
        assert!(matches!(err, Err(Error::InvalidData(_))));
    }
}
