//! Device operator tests: eltwise, matmul, transpose, reduce, layout ops

mod common;

use common::*;
use tilr::ops;
use tilr::prelude::*;

#[test]
fn test_add_roundtrip_f32() {
    let device = open_device();
    let data = random_values(32 * 32, 1);
    let host = Tensor::from_slice(&data, &[32, 32]).unwrap();
    let a = host.to_device(&device, MemoryConfig::dram_interleaved()).unwrap();
    let b = host.to_device(&device, MemoryConfig::dram_interleaved()).unwrap();

    let out = ops::add(&a, &b, &DispatchOptions::default()).unwrap();
    device.synchronize().unwrap();

    let result = out.to_host().unwrap().to_f32_vec().unwrap();
    let expected: Vec<f32> = data.iter().map(|&v| v + v).collect();
    assert_eq!(result, expected);
    device.close().unwrap();
}

#[test]
fn test_eltwise_bf16_tiled() {
    let device = open_device();
    let data = random_values(64 * 64, 2);
    let host = Tensor::from_f32_slice(&data, &[64, 64], DType::BF16)
        .unwrap()
        .to_layout(PageLayout::Tile)
        .unwrap();
    let a = host.to_device(&device, MemoryConfig::dram_interleaved()).unwrap();
    let b = host.to_device(&device, MemoryConfig::dram_interleaved()).unwrap();

    let out = ops::mul(&a, &b, &DispatchOptions::default()).unwrap();
    device.synchronize().unwrap();

    let result = out.to_host().unwrap().to_f32_vec().unwrap();
    let q = quantize_bf16(&data);
    let expected = quantize_bf16(&q.iter().map(|&v| v * v).collect::<Vec<_>>());
    assert_eq!(result, expected);
    device.close().unwrap();
}

#[test]
fn test_eltwise_shape_mismatch_rejected() {
    let device = open_device();
    let a = Tensor::from_slice(&[1.0f32; 16], &[4, 4])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();
    let b = Tensor::from_slice(&[1.0f32; 8], &[2, 4])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();
    assert!(matches!(
        ops::add(&a, &b, &DispatchOptions::default()),
        Err(Error::ShapeMismatch { .. })
    ));
    device.close().unwrap();
}

#[test]
fn test_unary_relu_exp() {
    let device = open_device();
    let data = vec![-2.0f32, -1.0, 0.0, 1.0, 2.0, 3.0, -0.5, 0.5];
    let a = Tensor::from_slice(&data, &[2, 4])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();

    let relu = ops::relu(&a, &DispatchOptions::default()).unwrap();
    let exp = ops::exp(&a, &DispatchOptions::default()).unwrap();
    device.synchronize().unwrap();

    let relu_out = relu.to_host().unwrap().to_f32_vec().unwrap();
    assert_eq!(relu_out, vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.5]);
    let exp_out = exp.to_host().unwrap().to_f32_vec().unwrap();
    let expected: Vec<f32> = data.iter().map(|&v| (v as f64).exp() as f32).collect();
    assert_allclose_f32(&exp_out, &expected, 1e-6, 0.0, "exp");
    device.close().unwrap();
}

#[test]
fn test_matmul_known_values() {
    let device = open_device();
    let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();
    let b = Tensor::from_slice(&[7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();

    let out = ops::matmul(
        &a,
        &b,
        &DispatchOptions::with_compute(ComputeKernelConfig::high_precision()),
    )
    .unwrap();
    device.synchronize().unwrap();

    let result = out.to_host().unwrap().to_f32_vec().unwrap();
    assert_eq!(result, vec![58.0, 64.0, 139.0, 154.0]);
    device.close().unwrap();
}

#[test]
fn test_matmul_fidelity_levels_diverge() {
    let device = open_device();
    let data_a = random_values(32 * 32, 3);
    let data_b = random_values(32 * 32, 4);
    let mk = |data: &[f32]| {
        Tensor::from_f32_slice(data, &[32, 32], DType::BF16)
            .unwrap()
            .to_layout(PageLayout::Tile)
            .unwrap()
            .to_device(&device, MemoryConfig::dram_interleaved())
            .unwrap()
    };
    let a = mk(&data_a);
    let b = mk(&data_b);

    let hifi = ops::matmul(
        &a,
        &b,
        &DispatchOptions::with_compute(ComputeKernelConfig::high_precision()),
    )
    .unwrap();
    let lofi = ops::matmul(
        &a,
        &b,
        &DispatchOptions::with_compute(ComputeKernelConfig::low_precision()),
    )
    .unwrap();
    device.synchronize().unwrap();

    let hifi_out = hifi.to_host().unwrap().to_f32_vec().unwrap();
    let lofi_out = lofi.to_host().unwrap().to_f32_vec().unwrap();
    // reduced fidelity stays correlated with the full-precision result
    assert_pcc(&hifi_out, &lofi_out, 0.98, "lofi vs hifi");
    device.close().unwrap();
}

#[test]
fn test_transpose_self_inverse_row_major() {
    let device = open_device();
    let data = random_values(2 * 3 * 4 * 5, 5);
    let a = Tensor::from_slice(&data, &[2, 3, 4, 5])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();

    for (d0, d1) in [(0isize, 1isize), (1, 3), (2, 3), (0, 3)] {
        let t = ops::transpose(&a, d0, d1, &DispatchOptions::default()).unwrap();
        let back = ops::transpose(&t, d0, d1, &DispatchOptions::default()).unwrap();
        device.synchronize().unwrap();
        assert_eq!(back.shape(), a.shape());
        let result = back.to_host().unwrap().to_f32_vec().unwrap();
        assert_eq!(result, data, "transpose({d0},{d1}) not self-inverse");
    }
    device.close().unwrap();
}

#[test]
fn test_transpose_self_inverse_tiled() {
    let device = open_device();
    let data = random_values(64 * 96, 6);
    let a = Tensor::from_f32_slice(&data, &[1, 1, 64, 96], DType::BF16)
        .unwrap()
        .to_layout(PageLayout::Tile)
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();

    let t = ops::transpose(&a, -2, -1, &DispatchOptions::default()).unwrap();
    assert_eq!(t.shape(), &[1, 1, 96, 64]);
    let back = ops::transpose(&t, -2, -1, &DispatchOptions::default()).unwrap();
    device.synchronize().unwrap();

    let result = back.to_host().unwrap().to_f32_vec().unwrap();
    assert_eq!(result, quantize_bf16(&data));
    device.close().unwrap();
}

#[test]
fn test_reduce_sum_and_mean() {
    let device = open_device();
    let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
    let a = Tensor::from_slice(&data, &[2, 3, 4])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();

    let sum = ops::reduce_sum(
        &a,
        1,
        &DispatchOptions::with_compute(ComputeKernelConfig::high_precision()),
    )
    .unwrap();
    let mean = ops::reduce_mean(
        &a,
        1,
        &DispatchOptions::with_compute(ComputeKernelConfig::high_precision()),
    )
    .unwrap();
    device.synchronize().unwrap();

    assert_eq!(sum.shape(), &[2, 1, 4]);
    let sum_out = sum.to_host().unwrap().to_f32_vec().unwrap();
    assert_eq!(sum_out, vec![12.0, 15.0, 18.0, 21.0, 48.0, 51.0, 54.0, 57.0]);
    let mean_out = mean.to_host().unwrap().to_f32_vec().unwrap();
    assert_eq!(mean_out, vec![4.0, 5.0, 6.0, 7.0, 16.0, 17.0, 18.0, 19.0]);
    device.close().unwrap();
}

#[test]
fn test_reduce_max_exact() {
    let device = open_device();
    let data = vec![3.0f32, -1.0, 7.0, 2.0, -5.0, 9.0, 0.0, 4.0];
    let a = Tensor::from_slice(&data, &[2, 4])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();
    let out = ops::reduce_max(&a, -1, &DispatchOptions::default()).unwrap();
    device.synchronize().unwrap();
    assert_eq!(
        out.to_host().unwrap().to_f32_vec().unwrap(),
        vec![7.0, 9.0]
    );
    device.close().unwrap();
}

#[test]
fn test_device_tilize_untilize_roundtrip() {
    let device = open_device();
    let data = random_values(64 * 64, 7);
    let rm = Tensor::from_slice(&data, &[64, 64])
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();

    let tiled = ops::tilize(&rm, &DispatchOptions::default()).unwrap();
    assert_eq!(tiled.layout(), PageLayout::Tile);
    let back = ops::untilize(&tiled, &DispatchOptions::default()).unwrap();
    device.synchronize().unwrap();

    assert_eq!(back.to_host().unwrap().to_f32_vec().unwrap(), data);
    device.close().unwrap();
}

#[test]
fn test_reduce_rejects_tiled_input() {
    let device = open_device();
    let a = Tensor::from_f32_slice(&random_values(64 * 64, 8), &[64, 64], DType::BF16)
        .unwrap()
        .to_layout(PageLayout::Tile)
        .unwrap()
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();
    assert!(matches!(
        ops::reduce_sum(&a, 0, &DispatchOptions::default()),
        Err(Error::InvalidLayout { .. })
    ));
    device.close().unwrap();
}

#[test]
fn test_blocking_dispatch_mode() {
    let device = open_device();
    let data = random_values(32 * 32, 9);
    let host = Tensor::from_slice(&data, &[32, 32]).unwrap();
    let a = host.to_device(&device, MemoryConfig::dram_interleaved()).unwrap();

    let opts = DispatchOptions {
        mode: ExecMode::Blocking,
        ..DispatchOptions::default()
    };
    let out = ops::add(&a, &a, &opts).unwrap();
    // blocking enqueue means results are visible without an explicit sync
    let result = out.to_host().unwrap().to_f32_vec().unwrap();
    let expected: Vec<f32> = data.iter().map(|&v| v + v).collect();
    assert_eq!(result, expected);
    device.close().unwrap();
}
