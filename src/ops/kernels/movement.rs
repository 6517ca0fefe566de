//! Data-movement kernel emulation: transpose, layout conversion, reorders

use super::{pack_output, unpack_input};
use crate::dtype::DType;
use crate::error::Result;
use crate::memory::{apply_runs, CopyRun};
use crate::ops::program::ProgramBinding;
use crate::tensor::{layout as tile_layout, shape as shape_util, PageLayout};

/// Swap two logical dimensions
///
/// Runs in the canonical (row-major logical) domain: tiled inputs are
/// untilized, permuted, and retilized. The f64 workspace round trip is
/// lossless for scalar dtypes, so transpose is exactly self-inverse there.
pub(crate) fn transpose(
    shape: &[usize],
    d0: usize,
    d1: usize,
    dtype: DType,
    layout: PageLayout,
    binding: &ProgramBinding,
) -> Result<()> {
    let volume = shape_util::volume(shape);
    let mut values = unpack_input(binding, 0, dtype, volume)?;

    if layout == PageLayout::Tile {
        values = tile_layout::untilize(
            &values,
            shape_util::flat_rows(shape),
            shape_util::flat_cols(shape),
        );
    }

    let mut out_shape = shape.to_vec();
    out_shape.swap(d0, d1);

    let out_strides = row_major_strides(&out_shape);

    let mut out = vec![0.0f64; volume];
    let mut idx = vec![0usize; shape.len()];
    for &v in &values {
        // map the logical index through the dim swap
        let mut dst = 0usize;
        for (d, &i) in idx.iter().enumerate() {
            let od = if d == d0 {
                d1
            } else if d == d1 {
                d0
            } else {
                d
            };
            dst += i * out_strides[od];
        }
        out[dst] = v;

        // advance the logical index
        for d in (0..shape.len()).rev() {
            idx[d] += 1;
            if idx[d] < shape[d] {
                break;
            }
            idx[d] = 0;
        }
    }

    if layout == PageLayout::Tile {
        out = tile_layout::tilize(
            &out,
            shape_util::flat_rows(&out_shape),
            shape_util::flat_cols(&out_shape),
        );
    }
    pack_output(binding, &out, dtype)
}

/// Convert between row-major and tiled page order
pub(crate) fn layout_convert(
    to_tiled: bool,
    rows: usize,
    cols: usize,
    dtype: DType,
    binding: &ProgramBinding,
) -> Result<()> {
    let values = unpack_input(binding, 0, dtype, rows * cols)?;
    let out = if to_tiled {
        tile_layout::tilize(&values, rows, cols)
    } else {
        tile_layout::untilize(&values, rows, cols)
    };
    pack_output(binding, &out, dtype)
}

/// Apply a single reorder run list (interleaved <-> sharded)
pub(crate) fn reorder(runs: &[CopyRun], binding: &ProgramBinding) -> Result<()> {
    let src = binding.inputs[0].read_all()?;
    let mut dst = vec![0u8; binding.output.size()];
    apply_runs(runs, &src, &mut dst);
    binding.output.write(0, &dst)
}

/// Reshard: gather to a canonical intermediate, then scatter to the new
/// shard arrangement
pub(crate) fn reshard(
    to_canonical: &[CopyRun],
    canonical_bytes: usize,
    to_sharded: &[CopyRun],
    binding: &ProgramBinding,
) -> Result<()> {
    let src = binding.inputs[0].read_all()?;
    let mut canonical = vec![0u8; canonical_bytes];
    apply_runs(to_canonical, &src, &mut canonical);
    let mut dst = vec![0u8; binding.output.size()];
    apply_runs(to_sharded, &canonical, &mut dst);
    binding.output.write(0, &dst)
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}
