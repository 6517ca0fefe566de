//! Reduction kernel emulation

use super::{pack_output, unpack_input};
use crate::dtype::DType;
use crate::error::Result;
use crate::ops::program::{ProgramBinding, ReduceOp};
use crate::tensor::shape as shape_util;

/// Reduce one dimension, keeping it as size 1
///
/// Float accumulation follows `fp32_dest_acc_en`: partials round to bf16
/// after every step unless f32 accumulation is enabled. Integer inputs
/// accumulate exactly.
pub(crate) fn reduce(
    op: ReduceOp,
    shape: &[usize],
    dim: usize,
    dtype: DType,
    fp32_acc: bool,
    binding: &ProgramBinding,
) -> Result<()> {
    let volume = shape_util::volume(shape);
    let values = unpack_input(binding, 0, dtype, volume)?;

    let reduce_len = shape[dim];
    let inner: usize = shape[dim + 1..].iter().product();
    let outer: usize = shape[..dim].iter().product();

    let exact = dtype.is_int() || matches!(op, ReduceOp::Max);
    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let base = o * reduce_len * inner + i;
            let mut acc = match op {
                ReduceOp::Max => f64::NEG_INFINITY,
                _ => 0.0,
            };
            for r in 0..reduce_len {
                let v = values[base + r * inner];
                acc = match op {
                    ReduceOp::Max => acc.max(v),
                    _ => {
                        let sum = acc + v;
                        if exact {
                            sum
                        } else if fp32_acc {
                            sum as f32 as f64
                        } else {
                            half::bf16::from_f64(sum).to_f64()
                        }
                    }
                };
            }
            if op == ReduceOp::Mean {
                acc /= reduce_len as f64;
            }
            out.push(acc);
        }
    }
    pack_output(binding, &out, dtype)
}
