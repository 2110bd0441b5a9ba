#![allow(dead_code)]

use std::sync::Arc;

use qd_datastore::buffer::BufferStore;
use qd_datastore::{Catalog, Config, ConnectionDescriptor, DatasetBuilder, ParameterSpec, SampleIdentity};
use tempfile::TempDir;

pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub local: Arc<Catalog>,
    pub remote: Arc<Catalog>,
}

pub fn create_test_config(dir: &TempDir) -> Config {
    Config {
        local: Some(ConnectionDescriptor::file(dir.path().join("local.sqlite"))),
        remote: Some(ConnectionDescriptor::file(dir.path().join("remote.sqlite"))),
        identity: SampleIdentity::new("six_dots", "XLD", "SQ21"),
        commit_interval_ms: 0,
        node_id: Some(3),
        ..Config::default()
    }
}

pub fn env() -> TestEnv {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir);
    let local = Arc::new(Catalog::open(config.local_descriptor().unwrap(), 4).unwrap());
    let remote = Arc::new(Catalog::open(config.remote_descriptor().unwrap(), 4).unwrap());
    TestEnv {
        dir,
        config,
        local,
        remote,
    }
}

/// One setpoint `t` of 5 points and one measured `P` over it.
pub fn ramsey() -> DatasetBuilder {
    DatasetBuilder::new("ramsey")
        .parameter(ParameterSpec::setpoint("t", "time", "ns", 5))
        .parameter(ParameterSpec::measured("P", "probability", "", &["t"]))
}

pub const RAMSEY_T: [f64; 5] = [0.0, 100.0, 200.0, 300.0, 400.0];
pub const RAMSEY_P: [f64; 5] = [0.1, 0.2, 0.3, 0.4, 0.5];

/// Finished ramsey dataset in `catalog`; returns its uuid.
pub fn finished_ramsey(catalog: &Arc<Catalog>, config: &Config) -> i64 {
    let mut writer = ramsey().create(Arc::clone(catalog), config).unwrap();
    writer.add_result(&[("t", &RAMSEY_T), ("P", &RAMSEY_P)]).unwrap();
    writer.finish().unwrap()
}

/// Full blob contents of every parameter row of `uuid`.
pub fn blob_contents(catalog: &Catalog, uuid: i64) -> Vec<Vec<f64>> {
    let raw = catalog.get_dataset_raw(uuid).unwrap();
    let store = BufferStore::new(catalog.blobs.clone(), 1);
    raw.parameters
        .iter()
        .map(|p| store.read(p.oid, 0, p.total_size as usize).unwrap())
        .collect()
}

/// Equality that treats NaN as equal to NaN.
pub fn same_samples(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x.is_nan() && y.is_nan()) || x == y)
}
