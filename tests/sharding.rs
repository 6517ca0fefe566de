//! Sharding data movement: interleaved <-> sharded round trips and reshard

mod common;

use common::*;
use tilr::ops;
use tilr::prelude::*;

struct ReshardCase {
    shape: [usize; 4],
    in_grid: Vec<((usize, usize), (usize, usize))>,
    in_shard: [usize; 2],
    in_orientation: ShardOrientation,
    in_scheme: TensorMemoryLayout,
    out_grid: Vec<((usize, usize), (usize, usize))>,
    out_shard: [usize; 2],
    out_orientation: ShardOrientation,
    out_scheme: TensorMemoryLayout,
}

fn grid(ranges: &[((usize, usize), (usize, usize))]) -> CoreRangeSet {
    CoreRangeSet::new(
        ranges
            .iter()
            .map(|&(start, end)| {
                CoreRange::new(
                    CoreCoord::new(start.0, start.1),
                    CoreCoord::new(end.0, end.1),
                )
                .unwrap()
            })
            .collect(),
    )
    .unwrap()
}

/// interleaved -> sharded -> reshard -> interleaved, compared to the source
fn run_reshard_case(device: &Device, case: &ReshardCase, dtype: DType) {
    let volume: usize = case.shape.iter().product();
    let data = random_values(volume, 42);
    let host = if dtype == DType::Bfp8 {
        Tensor::from_f32_slice(&data, &case.shape, dtype).unwrap()
    } else {
        Tensor::from_f32_slice(&data, &case.shape, dtype)
            .unwrap()
            .to_layout(PageLayout::Tile)
            .unwrap()
    };

    let interleaved = host
        .to_device(device, MemoryConfig::dram_interleaved())
        .unwrap();
    let sharded = ops::interleaved_to_sharded(
        &interleaved,
        ShardSpec::new(grid(&case.in_grid), case.in_shard, case.in_orientation),
        case.in_scheme,
        BufferType::L1,
        &DispatchOptions::default(),
    )
    .unwrap();

    let resharded = ops::reshard(
        &sharded,
        MemoryConfig::sharded(
            case.out_scheme,
            BufferType::L1,
            ShardSpec::new(grid(&case.out_grid), case.out_shard, case.out_orientation),
        ),
        &DispatchOptions::default(),
    )
    .unwrap();

    let back = ops::sharded_to_interleaved(
        &resharded,
        MemoryConfig::dram_interleaved(),
        &DispatchOptions::default(),
    )
    .unwrap();
    device.synchronize().unwrap();

    let result = back.to_host().unwrap().to_f32_vec().unwrap();
    let golden = host.to_f32_vec().unwrap();
    assert_eq!(result.len(), golden.len());
    if dtype == DType::Bfp8 {
        assert_pcc(&golden, &result, 0.99, "bfp8 reshard roundtrip");
    } else {
        assert_eq!(result, golden, "reshard roundtrip not exact");
    }

    // free L1 between cases
    sharded.deallocate().unwrap();
    resharded.deallocate().unwrap();
}

#[test]
fn test_reshard_width_to_height() {
    let device = open_device();
    run_reshard_case(
        &device,
        &ReshardCase {
            shape: [1, 1, 64, 64],
            in_grid: vec![((0, 0), (0, 1))],
            in_shard: [64, 32],
            in_orientation: ShardOrientation::RowMajor,
            in_scheme: TensorMemoryLayout::WidthSharded,
            out_grid: vec![((0, 0), (0, 1))],
            out_shard: [32, 64],
            out_orientation: ShardOrientation::RowMajor,
            out_scheme: TensorMemoryLayout::HeightSharded,
        },
        DType::BF16,
    );
    device.close().unwrap();
}

#[test]
fn test_reshard_block_regrid() {
    let device = open_device();
    run_reshard_case(
        &device,
        &ReshardCase {
            shape: [1, 1, 128, 64],
            in_grid: vec![((0, 0), (0, 1))],
            in_shard: [64, 64],
            in_orientation: ShardOrientation::RowMajor,
            in_scheme: TensorMemoryLayout::BlockSharded,
            out_grid: vec![((0, 0), (1, 3))],
            out_shard: [32, 32],
            out_orientation: ShardOrientation::RowMajor,
            out_scheme: TensorMemoryLayout::BlockSharded,
        },
        DType::BF16,
    );
    device.close().unwrap();
}

#[test]
fn test_reshard_col_major_orientation() {
    let device = open_device();
    run_reshard_case(
        &device,
        &ReshardCase {
            shape: [1, 1, 32, 128],
            in_grid: vec![((0, 0), (0, 3))],
            in_shard: [32, 32],
            in_orientation: ShardOrientation::ColMajor,
            in_scheme: TensorMemoryLayout::BlockSharded,
            out_grid: vec![((0, 0), (0, 1))],
            out_shard: [32, 64],
            out_orientation: ShardOrientation::ColMajor,
            out_scheme: TensorMemoryLayout::BlockSharded,
        },
        DType::BF16,
    );
    device.close().unwrap();
}

// the resnet50 activation reshard: 56 cores -> 48-plus-one cores
#[test]
fn test_reshard_rn50_height_shard_bf16() {
    let device = open_device();
    run_reshard_case(
        &device,
        &ReshardCase {
            shape: [1, 1, 62720, 256],
            in_grid: vec![((0, 0), (7, 6))],
            in_shard: [1120, 256],
            in_orientation: ShardOrientation::RowMajor,
            in_scheme: TensorMemoryLayout::HeightSharded,
            out_grid: vec![((0, 0), (7, 5)), ((0, 6), (0, 6))],
            out_shard: [1280, 256],
            out_orientation: ShardOrientation::RowMajor,
            out_scheme: TensorMemoryLayout::HeightSharded,
        },
        DType::BF16,
    );
    device.close().unwrap();
}

#[test]
fn test_reshard_rn50_height_shard_bfp8() {
    let device = open_device();
    run_reshard_case(
        &device,
        &ReshardCase {
            shape: [1, 1, 62720, 256],
            in_grid: vec![((0, 0), (7, 6))],
            in_shard: [1120, 256],
            in_orientation: ShardOrientation::RowMajor,
            in_scheme: TensorMemoryLayout::HeightSharded,
            out_grid: vec![((0, 0), (7, 5)), ((0, 6), (0, 6))],
            out_shard: [1280, 256],
            out_orientation: ShardOrientation::RowMajor,
            out_scheme: TensorMemoryLayout::HeightSharded,
        },
        DType::Bfp8,
    );
    device.close().unwrap();
}

#[test]
fn test_sharded_to_interleaved_alone() {
    let device = open_device();
    let data = random_values(64 * 64, 3);
    let host = Tensor::from_f32_slice(&data, &[1, 1, 64, 64], DType::BF16)
        .unwrap()
        .to_layout(PageLayout::Tile)
        .unwrap();
    let interleaved = host
        .to_device(&device, MemoryConfig::dram_interleaved())
        .unwrap();
    let sharded = ops::interleaved_to_sharded(
        &interleaved,
        ShardSpec::new(
            CoreRangeSet::rect((0, 0), (0, 1)).unwrap(),
            [32, 64],
            ShardOrientation::RowMajor,
        ),
        TensorMemoryLayout::HeightSharded,
        BufferType::L1,
        &DispatchOptions::default(),
    )
    .unwrap();
    let back = ops::sharded_to_interleaved(
        &sharded,
        MemoryConfig::dram_interleaved(),
        &DispatchOptions::default(),
    )
    .unwrap();
    device.synchronize().unwrap();

    assert_eq!(
        back.to_host().unwrap().to_f32_vec().unwrap(),
        host.to_f32_vec().unwrap()
    );
    device.close().unwrap();
}

#[test]
fn test_direct_sharded_transfer_roundtrip() {
    // writing a sharded tensor directly from host, no intermediate op
    let device = open_device();
    let data = random_values(128 * 32, 4);
    let memory = MemoryConfig::sharded(
        TensorMemoryLayout::HeightSharded,
        BufferType::L1,
        ShardSpec::new(
            CoreRangeSet::rect((0, 0), (3, 0)).unwrap(),
            [32, 32],
            ShardOrientation::RowMajor,
        ),
    );
    let host = Tensor::from_slice(&data, &[128, 32]).unwrap();
    let sharded = host.to_device(&device, memory).unwrap();
    device.synchronize().unwrap();

    assert_eq!(sharded.to_host().unwrap().to_f32_vec().unwrap(), data);
    device.close().unwrap();
}

#[test]
fn test_uneven_shard_grid_rejected() {
    let device = open_device();
    let host = Tensor::from_slice(&random_values(80 * 32, 5), &[80, 32]).unwrap();
    let memory = MemoryConfig::sharded(
        TensorMemoryLayout::HeightSharded,
        BufferType::L1,
        ShardSpec::new(
            CoreRangeSet::rect((0, 0), (2, 0)).unwrap(),
            [32, 32],
            ShardOrientation::RowMajor,
        ),
    );
    assert!(matches!(
        host.to_device(&device, memory),
        Err(Error::InvalidShardSpec { .. })
    ));
    device.close().unwrap();
}

#[test]
fn test_uneven_shard_grid_allowed_with_padding() {
    let device = open_device();
    let data = random_values(80 * 32, 6);
    let host = Tensor::from_slice(&data, &[80, 32]).unwrap();
    let memory = MemoryConfig::sharded(
        TensorMemoryLayout::HeightSharded,
        BufferType::L1,
        ShardSpec::new(
            CoreRangeSet::rect((0, 0), (2, 0)).unwrap(),
            [32, 32],
            ShardOrientation::RowMajor,
        )
        .with_padding(),
    );
    let sharded = host.to_device(&device, memory).unwrap();
    device.synchronize().unwrap();
    // padding is invisible after gathering back
    assert_eq!(sharded.to_host().unwrap().to_f32_vec().unwrap(), data);
    device.close().unwrap();
}

#[test]
fn test_shard_grid_exceeding_device_grid_rejected() {
    let device = open_device(); // wormhole: 8x8 grid
    let host = Tensor::from_slice(&random_values(320 * 32, 7), &[320, 32]).unwrap();
    let memory = MemoryConfig::sharded(
        TensorMemoryLayout::HeightSharded,
        BufferType::L1,
        ShardSpec::new(
            CoreRangeSet::rect((0, 0), (9, 0)).unwrap(),
            [32, 32],
            ShardOrientation::RowMajor,
        ),
    );
    assert!(matches!(
        host.to_device(&device, memory),
        Err(Error::InvalidShardSpec { .. })
    ));
    device.close().unwrap();
}
