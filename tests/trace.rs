//! Trace capture and replay: the two-phase protocol and address stability

mod common;

use common::*;
use tilr::ops;
use tilr::prelude::*;
use tilr::trace::release_trace;

fn preallocated(device: &Device, shape: &[usize]) -> Tensor {
    Tensor::allocate_on_device(
        shape,
        DType::F32,
        PageLayout::RowMajor,
        MemoryConfig::dram_interleaved(),
        device,
    )
    .unwrap()
}

#[test]
fn test_trace_replay_determinism() {
    let device = open_trace_device();
    let shape = [32, 32];
    let volume: usize = shape.iter().product();

    let input = preallocated(&device, &shape);
    let squared = preallocated(&device, &shape);
    let output = preallocated(&device, &shape);

    // warm up the program cache outside the capture
    let data = random_values(volume, 1);
    input
        .copy_from_host(&Tensor::from_slice(&data, &shape).unwrap(), 0)
        .unwrap();
    ops::mul_into(&input, &input, &squared, &DispatchOptions::default()).unwrap();
    ops::add_into(&squared, &input, &output, &DispatchOptions::default()).unwrap();
    device.synchronize().unwrap();

    // capture the op sequence once
    let tid = begin_trace_capture(&device, 0).unwrap();
    ops::mul_into(&input, &input, &squared, &DispatchOptions::default()).unwrap();
    ops::add_into(&squared, &input, &output, &DispatchOptions::default()).unwrap();
    end_trace_capture(&device, tid, 0).unwrap();

    // replay with fresh inputs re-copied to the same address
    for iter in 0..5u64 {
        let data = random_values(volume, 10 + iter);
        input
            .copy_from_host(&Tensor::from_slice(&data, &shape).unwrap(), 0)
            .unwrap();
        execute_trace(&device, tid, 0, true).unwrap();

        let result = output.to_host().unwrap().to_f32_vec().unwrap();
        let golden: Vec<f32> = data.iter().map(|&v| v * v + v).collect();
        assert_eq!(result, golden, "replay {iter} diverged");
    }

    // replaying the same input N times is bit-identical
    let data = random_values(volume, 99);
    let mut seen = Vec::new();
    for _ in 0..3 {
        input
            .copy_from_host(&Tensor::from_slice(&data, &shape).unwrap(), 0)
            .unwrap();
        execute_trace(&device, tid, 0, true).unwrap();
        seen.push(output.to_host().unwrap().to_f32_vec().unwrap());
    }
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[1], seen[2]);

    release_trace(&device, tid).unwrap();
    device.close().unwrap();
}

#[test]
fn test_allocation_forbidden_during_capture() {
    let device = open_trace_device();
    let input = preallocated(&device, &[32, 32]);
    device.synchronize().unwrap();

    let tid = begin_trace_capture(&device, 0).unwrap();

    // plain ops allocate their output, which a capture must reject
    assert!(matches!(
        ops::add(&input, &input, &DispatchOptions::default()),
        Err(Error::AllocationDuringCapture)
    ));
    assert!(matches!(
        Tensor::allocate_on_device(
            &[32, 32],
            DType::F32,
            PageLayout::RowMajor,
            MemoryConfig::dram_interleaved(),
            &device,
        ),
        Err(Error::AllocationDuringCapture)
    ));

    end_trace_capture(&device, tid, 0).unwrap();
    // allocation works again after the capture ends
    assert!(ops::add(&input, &input, &DispatchOptions::default()).is_ok());
    device.close().unwrap();
}

#[test]
fn test_readback_forbidden_during_capture() {
    let device = open_trace_device();
    let input = preallocated(&device, &[32, 32]);
    device.synchronize().unwrap();

    let tid = begin_trace_capture(&device, 0).unwrap();
    assert!(input.to_host().is_err());
    end_trace_capture(&device, tid, 0).unwrap();
    device.close().unwrap();
}

#[test]
fn test_replay_after_release_fails_address_check() {
    let device = open_trace_device();
    let input = preallocated(&device, &[32, 32]);
    let output = preallocated(&device, &[32, 32]);
    device.synchronize().unwrap();

    let tid = begin_trace_capture(&device, 0).unwrap();
    ops::add_into(&input, &input, &output, &DispatchOptions::default()).unwrap();
    end_trace_capture(&device, tid, 0).unwrap();

    execute_trace(&device, tid, 0, true).unwrap();

    // releasing a referenced tensor invalidates its captured address
    let released_addr = output.buffer_address().unwrap();
    output.deallocate().unwrap();
    match execute_trace(&device, tid, 0, true) {
        Err(Error::TraceAddressMismatch { addr }) => assert_eq!(addr, released_addr),
        other => panic!("expected TraceAddressMismatch, got {other:?}"),
    }
    device.close().unwrap();
}

#[test]
fn test_trace_requires_trace_region() {
    let device = open_device(); // no trace region configured
    assert!(matches!(
        begin_trace_capture(&device, 0),
        Err(Error::InvalidArgument { .. })
    ));
    device.close().unwrap();
}

#[test]
fn test_trace_region_exhaustion() {
    let device = Device::open(
        0,
        DeviceConfig {
            trace_region_size: 256, // tiny: a couple of commands at most
            ..DeviceConfig::default()
        },
    )
    .unwrap();
    let input = preallocated(&device, &[32, 32]);
    let output = preallocated(&device, &[32, 32]);
    device.synchronize().unwrap();

    let tid = begin_trace_capture(&device, 0).unwrap();
    for _ in 0..8 {
        ops::add_into(&input, &input, &output, &DispatchOptions::default()).unwrap();
    }
    assert!(matches!(
        end_trace_capture(&device, tid, 0),
        Err(Error::TraceRegionExhausted { .. })
    ));
    device.close().unwrap();
}

#[test]
fn test_trace_not_found() {
    let device = open_trace_device();
    let input = preallocated(&device, &[32, 32]);
    let output = preallocated(&device, &[32, 32]);
    device.synchronize().unwrap();

    let tid = begin_trace_capture(&device, 0).unwrap();
    ops::add_into(&input, &input, &output, &DispatchOptions::default()).unwrap();
    end_trace_capture(&device, tid, 0).unwrap();
    release_trace(&device, tid).unwrap();

    assert!(matches!(
        execute_trace(&device, tid, 0, true),
        Err(Error::TraceNotFound { .. })
    ));
    device.close().unwrap();
}

#[test]
fn test_commands_on_other_queue_execute_during_capture() {
    let device = open_trace_device();
    let input = preallocated(&device, &[32, 32]);
    device.synchronize().unwrap();

    let data = random_values(32 * 32, 7);
    let tid = begin_trace_capture(&device, 0).unwrap();
    // queue 1 is not capturing; its copy executes normally
    input
        .copy_from_host(&Tensor::from_slice(&data, &[32, 32]).unwrap(), 1)
        .unwrap();
    end_trace_capture(&device, tid, 0).unwrap();
    device.synchronize().unwrap();

    assert_eq!(input.to_host_on(1).unwrap().to_f32_vec().unwrap(), data);
    device.close().unwrap();
}
