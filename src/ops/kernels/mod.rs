//! Program factories and kernel emulation
//!
//! `build_plan` is the compile step: it validates an operator signature and
//! produces a structure-only execution plan. `execute` is the device step:
//! it runs a plan against bound buffers on a queue worker. The split mirrors
//! the program-factory model — plans are cached, bindings are per-call.

mod eltwise;
mod matmul;
mod movement;
mod reduce;

use super::program::{KernelPlan, OpAttrs, OpKind, OpSignature, ProgramBinding, TensorSig};
use crate::dtype::{buffer_elems, DType};
use crate::error::{Error, Result};
use crate::memory::ShardLayout;
use crate::tensor::{shape as shape_util, PageLayout, TILE_HEIGHT, TILE_WIDTH};

/// Validate a signature and build its execution plan
pub(crate) fn build_plan(sig: &OpSignature) -> Result<KernelPlan> {
    match sig.kind {
        OpKind::Binary(op) => {
            let [a, b] = two_inputs(sig)?;
            if a.shape != b.shape {
                return Err(Error::shape_mismatch(&a.shape, &b.shape));
            }
            if a.dtype != b.dtype {
                return Err(Error::DTypeMismatch {
                    lhs: a.dtype,
                    rhs: b.dtype,
                });
            }
            if a.layout != b.layout || a.memory != b.memory {
                return Err(Error::invalid_layout(
                    "binary eltwise requires matching page layout and memory config",
                ));
            }
            if sig.output_memory != a.memory {
                return Err(Error::invalid_layout(
                    "binary eltwise output must keep the input memory config",
                ));
            }
            Ok(KernelPlan::Binary {
                op,
                dtype: a.dtype,
                elems: sig_buffer_elems(a)?,
            })
        }
        OpKind::Unary(op) => {
            let a = one_input(sig)?;
            if sig.output_memory != a.memory {
                return Err(Error::invalid_layout(
                    "unary eltwise output must keep the input memory config",
                ));
            }
            Ok(KernelPlan::Unary {
                op,
                dtype: a.dtype,
                elems: sig_buffer_elems(a)?,
            })
        }
        OpKind::Matmul => {
            let [a, b] = two_inputs(sig)?;
            require_interleaved(sig, a)?;
            require_interleaved(sig, b)?;
            require_interleaved_output(sig)?;
            if a.dtype != b.dtype {
                return Err(Error::DTypeMismatch {
                    lhs: a.dtype,
                    rhs: b.dtype,
                });
            }
            if a.layout != b.layout {
                return Err(Error::invalid_layout(
                    "matmul requires matching page layouts",
                ));
            }
            if a.shape.len() < 2 || b.shape.len() < 2 {
                return Err(Error::invalid_argument(
                    "input",
                    "matmul inputs need at least 2 dims",
                ));
            }
            let (m, k) = (a.shape[a.shape.len() - 2], a.shape[a.shape.len() - 1]);
            let (kb, n) = (b.shape[b.shape.len() - 2], b.shape[b.shape.len() - 1]);
            if k != kb {
                return Err(Error::shape_mismatch(&a.shape, &b.shape));
            }
            let batch_a = &a.shape[..a.shape.len() - 2];
            let batch_b = &b.shape[..b.shape.len() - 2];
            if batch_a != batch_b {
                return Err(Error::shape_mismatch(&a.shape, &b.shape));
            }
            if a.layout == PageLayout::Tile
                && (m % TILE_HEIGHT != 0 || k % TILE_WIDTH != 0 || n % TILE_WIDTH != 0)
            {
                return Err(Error::invalid_layout(format!(
                    "tiled matmul requires tile-aligned dims, got {m}x{k} @ {kb}x{n}"
                )));
            }
            Ok(KernelPlan::Matmul {
                batch: batch_a.iter().product(),
                m,
                k,
                n,
                dtype: a.dtype,
                layout: a.layout,
                compute: sig.compute,
            })
        }
        OpKind::Transpose => {
            let a = one_input(sig)?;
            require_interleaved(sig, a)?;
            require_interleaved_output(sig)?;
            let OpAttrs::TransposeDims(d0, d1) = sig.attrs else {
                return Err(Error::Internal("transpose without dims".into()));
            };
            let mut out_shape = a.shape.clone();
            out_shape.swap(d0, d1);
            a.layout.validate(&out_shape)?;
            Ok(KernelPlan::Transpose {
                shape: a.shape.clone(),
                d0,
                d1,
                dtype: a.dtype,
                layout: a.layout,
            })
        }
        OpKind::Reduce(op) => {
            let a = one_input(sig)?;
            require_interleaved(sig, a)?;
            require_interleaved_output(sig)?;
            if a.layout != PageLayout::RowMajor {
                return Err(Error::invalid_layout(
                    "reduce requires row-major pages; untilize first",
                ));
            }
            let OpAttrs::ReduceDim(dim) = sig.attrs else {
                return Err(Error::Internal("reduce without dim".into()));
            };
            Ok(KernelPlan::Reduce {
                op,
                shape: a.shape.clone(),
                dim,
                dtype: a.dtype,
                fp32_acc: sig.compute.fp32_dest_acc_en,
            })
        }
        OpKind::Tilize | OpKind::Untilize => {
            let a = one_input(sig)?;
            require_interleaved(sig, a)?;
            require_interleaved_output(sig)?;
            if a.dtype.is_block_float() {
                return Err(Error::unsupported_dtype(a.dtype, sig.kind.name()));
            }
            let to_tiled = sig.kind == OpKind::Tilize;
            let expect_in = if to_tiled {
                PageLayout::RowMajor
            } else {
                PageLayout::Tile
            };
            if a.layout != expect_in {
                return Err(Error::invalid_layout(format!(
                    "{} expects {:?} input pages",
                    sig.kind.name(),
                    expect_in
                )));
            }
            PageLayout::Tile.validate(&a.shape)?;
            Ok(KernelPlan::LayoutConvert {
                to_tiled,
                rows: shape_util::flat_rows(&a.shape),
                cols: shape_util::flat_cols(&a.shape),
                dtype: a.dtype,
            })
        }
        OpKind::InterleavedToSharded => {
            let a = one_input(sig)?;
            require_interleaved(sig, a)?;
            let layout = out_shard_layout(sig, a)?;
            Ok(KernelPlan::Reorder {
                runs: layout.runs_to_sharded(),
            })
        }
        OpKind::ShardedToInterleaved => {
            let a = one_input(sig)?;
            let layout = in_shard_layout(a)?;
            if sig.output_memory.is_sharded() {
                return Err(Error::invalid_layout(
                    "sharded_to_interleaved output must be interleaved",
                ));
            }
            Ok(KernelPlan::Reorder {
                runs: layout.runs_to_canonical(),
            })
        }
        OpKind::Reshard => {
            let a = one_input(sig)?;
            let src = in_shard_layout(a)?;
            let dst = out_shard_layout(sig, a)?;
            Ok(KernelPlan::Reshard {
                to_canonical: src.runs_to_canonical(),
                canonical_bytes: a.dtype.buffer_bytes(shape_util::volume(&a.shape)),
                to_sharded: dst.runs_to_sharded(),
            })
        }
    }
}

/// Cores a plan occupies, bounded by the device grid
pub(crate) fn core_count(plan: &KernelPlan, grid_cores: usize) -> usize {
    let work_units = match plan {
        KernelPlan::Binary { elems, .. } | KernelPlan::Unary { elems, .. } => {
            elems / (TILE_HEIGHT * TILE_WIDTH)
        }
        KernelPlan::Matmul { batch, m, n, .. } => {
            batch * m.div_ceil(TILE_HEIGHT) * n.div_ceil(TILE_WIDTH)
        }
        KernelPlan::Transpose { shape, .. } => shape_util::volume(shape) / (TILE_HEIGHT * TILE_WIDTH),
        KernelPlan::Reduce { shape, dim, .. } => shape_util::volume(shape) / shape[*dim].max(1),
        KernelPlan::LayoutConvert { rows, cols, .. } => (rows / TILE_HEIGHT) * (cols / TILE_WIDTH),
        KernelPlan::Reorder { runs } => runs.len(),
        KernelPlan::Reshard { to_sharded, .. } => to_sharded.len(),
    };
    work_units.clamp(1, grid_cores)
}

/// Run a plan against bound buffers
pub(crate) fn execute(plan: &KernelPlan, binding: &ProgramBinding) -> Result<()> {
    match plan {
        KernelPlan::Binary { op, dtype, elems } => eltwise::binary(*op, *dtype, *elems, binding),
        KernelPlan::Unary { op, dtype, elems } => eltwise::unary(*op, *dtype, *elems, binding),
        KernelPlan::Matmul {
            batch,
            m,
            k,
            n,
            dtype,
            layout,
            compute,
        } => matmul::matmul(*batch, *m, *k, *n, *dtype, *layout, *compute, binding),
        KernelPlan::Transpose {
            shape,
            d0,
            d1,
            dtype,
            layout,
        } => movement::transpose(shape, *d0, *d1, *dtype, *layout, binding),
        KernelPlan::Reduce {
            op,
            shape,
            dim,
            dtype,
            fp32_acc,
        } => reduce::reduce(*op, shape, *dim, *dtype, *fp32_acc, binding),
        KernelPlan::LayoutConvert {
            to_tiled,
            rows,
            cols,
            dtype,
        } => movement::layout_convert(*to_tiled, *rows, *cols, *dtype, binding),
        KernelPlan::Reorder { runs } => movement::reorder(runs, binding),
        KernelPlan::Reshard {
            to_canonical,
            canonical_bytes,
            to_sharded,
        } => movement::reshard(to_canonical, *canonical_bytes, to_sharded, binding),
    }
}

fn one_input(sig: &OpSignature) -> Result<&TensorSig> {
    sig.inputs
        .first()
        .ok_or_else(|| Error::Internal(format!("{} with no inputs", sig.kind.name())))
}

fn two_inputs(sig: &OpSignature) -> Result<[&TensorSig; 2]> {
    match sig.inputs.as_slice() {
        [a, b] => Ok([a, b]),
        other => Err(Error::Internal(format!(
            "{} expects 2 inputs, got {}",
            sig.kind.name(),
            other.len()
        ))),
    }
}

fn require_interleaved(sig: &OpSignature, t: &TensorSig) -> Result<()> {
    if t.memory.is_sharded() {
        return Err(Error::invalid_layout(format!(
            "{} requires interleaved inputs",
            sig.kind.name()
        )));
    }
    Ok(())
}

fn require_interleaved_output(sig: &OpSignature) -> Result<()> {
    if sig.output_memory.is_sharded() {
        return Err(Error::invalid_layout(format!(
            "{} writes an interleaved output",
            sig.kind.name()
        )));
    }
    Ok(())
}

fn in_shard_layout(t: &TensorSig) -> Result<ShardLayout> {
    let spec = t
        .memory
        .shard_spec
        .as_ref()
        .ok_or_else(|| Error::invalid_shard_spec("input is not sharded"))?;
    ShardLayout::build(&t.shape, t.layout, t.dtype, t.memory.layout, spec)
}

fn out_shard_layout(sig: &OpSignature, t: &TensorSig) -> Result<ShardLayout> {
    let spec = sig
        .output_memory
        .shard_spec
        .as_ref()
        .ok_or_else(|| Error::invalid_shard_spec("output memory config is not sharded"))?;
    ShardLayout::build(
        &t.shape,
        t.layout,
        t.dtype,
        sig.output_memory.layout,
        spec,
    )
}

/// Buffer element capacity for an input signature
fn sig_buffer_elems(t: &TensorSig) -> Result<usize> {
    if t.memory.is_sharded() {
        let layout = in_shard_layout(t)?;
        Ok(buffer_elems(layout.buffer_bytes(), t.dtype))
    } else {
        let volume = shape_util::volume(&t.shape);
        Ok(buffer_elems(t.dtype.buffer_bytes(volume), t.dtype))
    }
}

/// Read an input buffer and unpack it to the f64 workspace
pub(crate) fn unpack_input(
    binding: &ProgramBinding,
    idx: usize,
    dtype: DType,
    elems: usize,
) -> Result<Vec<f64>> {
    let bytes = binding.inputs[idx].read_all()?;
    Ok(crate::dtype::unpack_to_f64(&bytes, dtype, elems))
}

/// Pack the f64 workspace and write it to the output buffer
pub(crate) fn pack_output(binding: &ProgramBinding, values: &[f64], dtype: DType) -> Result<()> {
    let bytes = crate::dtype::pack_from_f64(values, dtype);
    binding.output.write(0, &bytes)
}
