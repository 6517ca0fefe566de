//! Matmul kernel emulation with fidelity modeling
//!
//! The math-unit model: operands are narrowed per the fidelity level before
//! each multiply, and partial sums accumulate either in f32 or in bf16
//! depending on `fp32_dest_acc_en`. Everything is deterministic, so two runs
//! with the same signature and inputs are bit-identical.

use super::{pack_output, unpack_input};
use crate::dtype::DType;
use crate::error::Result;
use crate::ops::compute::ComputeKernelConfig;
use crate::ops::program::ProgramBinding;
use crate::tensor::{layout as tile_layout, PageLayout};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

#[allow(clippy::too_many_arguments)]
pub(crate) fn matmul(
    batch: usize,
    m: usize,
    k: usize,
    n: usize,
    dtype: DType,
    layout: PageLayout,
    compute: ComputeKernelConfig,
    binding: &ProgramBinding,
) -> Result<()> {
    let mut a = unpack_input(binding, 0, dtype, batch * m * k)?;
    let mut b = unpack_input(binding, 1, dtype, batch * k * n)?;

    // tiled buffers hold tile order over the flattened 2D view
    if layout == PageLayout::Tile {
        a = tile_layout::untilize(&a, batch * m, k);
        b = tile_layout::untilize(&b, batch * k, n);
    }

    let truncate_a = compute.math_fidelity.truncates_a();
    let truncate_b = compute.math_fidelity.truncates_b();
    let narrow = |v: f64, truncate: bool| -> f32 {
        if truncate {
            half::bf16::from_f64(v).to_f32()
        } else {
            v as f32
        }
    };

    let row_of = |bi: usize, i: usize, a: &[f64], b: &[f64]| -> Vec<f64> {
        let a_base = bi * m * k + i * k;
        let b_base = bi * k * n;
        let mut row = vec![0.0f64; n];
        for (j, slot) in row.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for kk in 0..k {
                let x = narrow(a[a_base + kk], truncate_a);
                let y = narrow(b[b_base + kk * n + j], truncate_b);
                let term = x * y;
                acc = if compute.fp32_dest_acc_en {
                    acc + term
                } else {
                    half::bf16::from_f32(acc + term).to_f32()
                };
            }
            *slot = acc as f64;
        }
        row
    };

    #[cfg(feature = "rayon")]
    let mut out: Vec<f64> = (0..batch * m)
        .into_par_iter()
        .flat_map_iter(|r| row_of(r / m, r % m, &a, &b).into_iter())
        .collect();

    #[cfg(not(feature = "rayon"))]
    let mut out: Vec<f64> = {
        let mut out = Vec::with_capacity(batch * m * n);
        for r in 0..batch * m {
            out.extend(row_of(r / m, r % m, &a, &b));
        }
        out
    };

    if layout == PageLayout::Tile {
        out = tile_layout::tilize(&out, batch * m, n);
    }
    pack_output(binding, &out, dtype)
}
