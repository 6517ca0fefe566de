//! Open a device, shard a tensor into L1, compute, and read it back.
//!
//! ```bash
//! cargo run --example device_roundtrip
//! ```

use tilr::ops;
use tilr::prelude::*;

fn main() -> Result<()> {
    let device = Device::open(0, DeviceConfig::default())?;
    println!(
        "opened device {} ({:?}, {} grid)",
        device.id(),
        device.arch(),
        device.core_grid()
    );

    let data: Vec<f32> = (0..128 * 64).map(|i| (i % 97) as f32 * 0.25).collect();
    let host = Tensor::from_f32_slice(&data, &[1, 1, 128, 64], DType::BF16)?
        .to_layout(PageLayout::Tile)?;

    // DRAM interleaved first, then spread over four cores in L1
    let interleaved = host.to_device(&device, MemoryConfig::dram_interleaved())?;
    let sharded = ops::interleaved_to_sharded(
        &interleaved,
        ShardSpec::new(
            CoreRangeSet::rect((0, 0), (3, 0))?,
            [32, 64],
            ShardOrientation::RowMajor,
        ),
        TensorMemoryLayout::HeightSharded,
        BufferType::L1,
        &DispatchOptions::default(),
    )?;

    let doubled = ops::add(&sharded, &sharded, &DispatchOptions::default())?;
    let back = ops::sharded_to_interleaved(
        &doubled,
        MemoryConfig::dram_interleaved(),
        &DispatchOptions::default(),
    )?;
    device.synchronize()?;

    let result = back.to_host()?.to_f32_vec()?;
    println!("first row: {:?}", &result[..8]);
    println!(
        "program cache: {} entries, {} hits, {} misses",
        device.program_cache().num_entries(),
        device.program_cache().hits(),
        device.program_cache().misses()
    );
    println!("{}", device.dump_memory_state());

    device.close()?;
    Ok(())
}
