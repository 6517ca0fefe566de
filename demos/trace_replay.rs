//! Capture an op sequence into a trace and replay it with fresh inputs.
//!
//! ```bash
//! cargo run --example trace_replay
//! ```

use tilr::ops;
use tilr::prelude::*;

fn main() -> Result<()> {
    let device = Device::open(
        0,
        DeviceConfig {
            num_hw_cqs: 2,
            trace_region_size: 1 << 20,
            ..DeviceConfig::default()
        },
    )?;

    let shape = [64, 64];
    // every tensor the trace touches is allocated up front, at fixed addresses
    let input = Tensor::allocate_on_device(
        &shape,
        DType::F32,
        PageLayout::RowMajor,
        MemoryConfig::dram_interleaved(),
        &device,
    )?;
    let scratch = Tensor::allocate_on_device(
        &shape,
        DType::F32,
        PageLayout::RowMajor,
        MemoryConfig::dram_interleaved(),
        &device,
    )?;
    let output = Tensor::allocate_on_device(
        &shape,
        DType::F32,
        PageLayout::RowMajor,
        MemoryConfig::dram_interleaved(),
        &device,
    )?;

    // warm up the program cache, then capture
    let warmup: Vec<f32> = vec![1.0; 64 * 64];
    input.copy_from_host(&Tensor::from_slice(&warmup, &shape)?, 0)?;
    ops::mul_into(&input, &input, &scratch, &DispatchOptions::default())?;
    ops::add_into(&scratch, &input, &output, &DispatchOptions::default())?;
    device.synchronize()?;

    let tid = begin_trace_capture(&device, 0)?;
    ops::mul_into(&input, &input, &scratch, &DispatchOptions::default())?;
    ops::add_into(&scratch, &input, &output, &DispatchOptions::default())?;
    end_trace_capture(&device, tid, 0)?;
    println!("captured trace {tid:?} at input address {:#x}", input.buffer_address()?);

    for run in 0..3 {
        let data: Vec<f32> = (0..64 * 64).map(|i| ((i + run) % 13) as f32).collect();
        input.copy_from_host(&Tensor::from_slice(&data, &shape)?, 0)?;
        execute_trace(&device, tid, 0, true)?;
        let result = output.to_host()?.to_f32_vec()?;
        println!("replay {run}: out[0..4] = {:?}", &result[..4]);
    }

    device.close()?;
    Ok(())
}
