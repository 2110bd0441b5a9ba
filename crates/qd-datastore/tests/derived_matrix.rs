mod common;

use std::sync::Arc;

use common::*;
use ndarray::{arr2, Array2};
use qd_datastore::{ChannelRatios, Conversion, DerivedMatrix};

#[test]
fn test_merge_keeps_known_coefficients() {
    let env = env();
    let start = arr2(&[[1.0, 0.1], [0.2, 1.0]]);
    DerivedMatrix::load(Arc::clone(&env.local), "X", &["a", "b"], None, Some(start)).unwrap();
    let second =
        DerivedMatrix::load(Arc::clone(&env.local), "X", &["b", "c"], None, Some(Array2::eye(2))).unwrap();
    assert_eq!(second.matrix(), &Array2::<f64>::eye(2));

    let stored = env.local.matrices.load_matrix("X").unwrap().unwrap();
    assert_eq!(stored.real_names, vec!["a", "b", "c"]);
    let full = DerivedMatrix::load(Arc::clone(&env.local), "X", &["a", "b", "c"], None, None).unwrap();
    assert_eq!(full.get("a", "b").unwrap(), 0.1);
    assert_eq!(full.get("b", "a").unwrap(), 0.2);
    assert_eq!(full.get("b", "c").unwrap(), 0.0);
    assert_eq!(full.get("c", "b").unwrap(), 0.0);
    for name in ["a", "b", "c"] {
        assert_eq!(full.get(name, name).unwrap(), 1.0);
    }
}

#[test]
fn test_reload_returns_saved_matrix() {
    let env = env();
    let m = arr2(&[[1.0, -0.3, 0.05], [0.1, 1.0, -0.2], [0.0, 0.4, 1.0]]);
    let names = ["P1", "P2", "P3"];
    let virtual_names = ["e1", "e2", "e3"];
    DerivedMatrix::load(Arc::clone(&env.local), "virtual gates", &names, Some(&virtual_names[..]), Some(m.clone()))
        .unwrap();

    let again = DerivedMatrix::load(Arc::clone(&env.local), "virtual gates", &names, Some(&virtual_names[..]), None)
        .unwrap();
    assert_eq!(again.matrix(), &m);
    assert_eq!(again.get("e2", "P3").unwrap(), -0.2);
}

#[test]
fn test_views_round_trip_to_stored_matrix() {
    let env = env();
    let m = arr2(&[[2.0, 0.5], [0.25, 1.0]]);
    let mut handle =
        DerivedMatrix::load(Arc::clone(&env.local), "crosstalk", &["P1", "P2"], None, Some(m.clone())).unwrap();
    {
        let view = handle.view(&[Conversion::Normalized]);
        let normalized = view.matrix().unwrap();
        assert!((normalized[[0, 0]] - 0.8).abs() < 1e-12);
        assert!((normalized[[0, 1]] - 0.2).abs() < 1e-12);
    }
    {
        let mut view = handle.view(&[Conversion::Inverted]);
        let inverse = view.matrix().unwrap();
        let product = m.dot(&inverse);
        assert!(product.iter().zip(Array2::<f64>::eye(2).iter()).all(|(a, b)| (a - b).abs() < 1e-9));
        let current = view.get("vP2", "P2").unwrap();
        view.set("vP2", "P2", current).unwrap();
    }
    let stored = env.local.matrices.load_matrix("crosstalk").unwrap().unwrap();
    for (row, expected) in stored.matrix.iter().zip(m.rows()) {
        for (a, b) in row.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}

#[test]
fn test_channel_ratios_persist_per_channel() {
    let env = env();
    let mut ratios = ChannelRatios::load(Arc::clone(&env.local), "sensor", &["ch1", "ch2"]).unwrap();
    ratios.set("ch2", 0.5).unwrap();
    let mut other = ChannelRatios::load(Arc::clone(&env.local), "sensor", &["ch3"]).unwrap();
    other.set("ch3", 2.0).unwrap();

    let all = ChannelRatios::load(Arc::clone(&env.local), "sensor", &["ch1", "ch2", "ch3"]).unwrap();
    let values: Vec<(&str, f64)> = all.iter().collect();
    assert_eq!(values, vec![("ch1", 1.0), ("ch2", 0.5), ("ch3", 2.0)]);
}
