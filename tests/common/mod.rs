//! Common test utilities
#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tilr::prelude::*;

/// Open a device with default options
pub fn open_device() -> Device {
    Device::open(0, DeviceConfig::default()).expect("device open failed")
}

/// Open a device with a trace region and two command queues
pub fn open_trace_device() -> Device {
    Device::open(
        0,
        DeviceConfig {
            num_hw_cqs: 2,
            trace_region_size: 1 << 20,
            ..DeviceConfig::default()
        },
    )
    .expect("device open failed")
}

/// Deterministic uniform values in [-1, 1)
pub fn random_values(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Deterministic standard-normal values
pub fn random_normal(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| rng.sample::<f32, _>(rand_distr::StandardNormal))
        .collect()
}

/// Quantize through bf16, matching what a BF16 tensor stores
pub fn quantize_bf16(values: &[f32]) -> Vec<f32> {
    values
        .iter()
        .map(|&v| half::bf16::from_f32(v).to_f32())
        .collect()
}

/// Assert two f32 slices are close within tolerance
///
/// Uses the formula: |a - b| <= atol + rtol * |b|
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

/// Pearson correlation coefficient between two value slices
pub fn comp_pcc(a: &[f32], b: &[f32]) -> f64 {
    assert_eq!(a.len(), b.len(), "pcc: length mismatch");
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let da = x as f64 - mean_a;
        let db = y as f64 - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 && var_b == 0.0 {
        return 1.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

/// Assert PCC meets a threshold, printing the value on failure
pub fn assert_pcc(golden: &[f32], actual: &[f32], threshold: f64, msg: &str) {
    let pcc = comp_pcc(golden, actual);
    assert!(pcc >= threshold, "{msg}: pcc {pcc} below {threshold}");
}
