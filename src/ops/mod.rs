//! Device operations: validation, signature extraction, dispatch
//!
//! Every operator follows the same path: validate configuration
//! synchronously, extract the structural signature, resolve a compiled
//! program through the device's cache (compile on miss, rebind on hit),
//! allocate the output unless a pre-allocated `_into` variant is used, and
//! enqueue the bound program on the chosen queue.

mod compute;
pub(crate) mod kernels;
mod program;

pub use compute::{ComputeKernelConfig, MathFidelity};
pub use program::{
    BinaryOp, CompiledProgram, OpAttrs, OpKind, OpSignature, ProgramBinding, ProgramCache,
    ReduceOp, TensorSig, UnaryOp,
};

use crate::device::{Command, Device, ExecMode};
use crate::error::{Error, Result};
use crate::memory::{BufferType, MemoryConfig, ShardSpec, TensorMemoryLayout};
use crate::tensor::{shape as shape_util, PageLayout, Tensor};
use std::sync::Arc;

/// Per-call dispatch options
///
/// Execution mode is explicit per enqueue; there is no device-wide async
/// toggle. `output_memory` overrides the output placement for ops that
/// don't fix it (matmul, transpose, reduce, tilize/untilize); eltwise ops
/// always keep their input's config.
#[derive(Clone, Debug, Default)]
pub struct DispatchOptions {
    /// Command queue to enqueue on
    pub cq_id: usize,
    /// Whether the host blocks until execution completes
    pub mode: ExecMode,
    /// Fidelity and accumulation knobs
    pub compute: ComputeKernelConfig,
    /// Output memory config override
    pub output_memory: Option<MemoryConfig>,
}

impl DispatchOptions {
    /// Options with a specific compute config
    pub fn with_compute(compute: ComputeKernelConfig) -> Self {
        Self {
            compute,
            ..Self::default()
        }
    }

    /// Options targeting a specific queue
    pub fn on_queue(cq_id: usize) -> Self {
        Self {
            cq_id,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// element-wise
// ---------------------------------------------------------------------------

/// Element-wise a + b
pub fn add(a: &Tensor, b: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    binary(BinaryOp::Add, a, b, opts)
}

/// Element-wise a - b
pub fn sub(a: &Tensor, b: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    binary(BinaryOp::Sub, a, b, opts)
}

/// Element-wise a * b
pub fn mul(a: &Tensor, b: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    binary(BinaryOp::Mul, a, b, opts)
}

/// Element-wise a + b into a pre-allocated output
pub fn add_into(a: &Tensor, b: &Tensor, out: &Tensor, opts: &DispatchOptions) -> Result<()> {
    binary_into(BinaryOp::Add, a, b, out, opts)
}

/// Element-wise a - b into a pre-allocated output
pub fn sub_into(a: &Tensor, b: &Tensor, out: &Tensor, opts: &DispatchOptions) -> Result<()> {
    binary_into(BinaryOp::Sub, a, b, out, opts)
}

/// Element-wise a * b into a pre-allocated output
pub fn mul_into(a: &Tensor, b: &Tensor, out: &Tensor, opts: &DispatchOptions) -> Result<()> {
    binary_into(BinaryOp::Mul, a, b, out, opts)
}

/// Element-wise e^a
pub fn exp(a: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    unary(UnaryOp::Exp, a, opts)
}

/// Element-wise max(a, 0)
pub fn relu(a: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    unary(UnaryOp::Relu, a, opts)
}

/// Element-wise sqrt(a)
pub fn sqrt(a: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    unary(UnaryOp::Sqrt, a, opts)
}

/// Element-wise unary op into a pre-allocated output
pub fn unary_into(op: UnaryOp, a: &Tensor, out: &Tensor, opts: &DispatchOptions) -> Result<()> {
    let device = a.device()?.clone();
    check_same_placement(out, a)?;
    let sig = OpSignature {
        kind: OpKind::Unary(op),
        inputs: vec![tensor_sig(a)?],
        output_memory: required_memory(out)?,
        attrs: OpAttrs::None,
        compute: opts.compute,
    };
    dispatch(&device, sig, vec![Arc::clone(a.buffer()?)], out, opts)
}

fn binary(op: BinaryOp, a: &Tensor, b: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    let device = same_device(a, b)?;
    let out = Tensor::allocate_on_device(
        a.shape(),
        a.dtype(),
        a.layout(),
        required_memory(a)?,
        &device,
    )?;
    binary_into(op, a, b, &out, opts)?;
    Ok(out)
}

fn binary_into(
    op: BinaryOp,
    a: &Tensor,
    b: &Tensor,
    out: &Tensor,
    opts: &DispatchOptions,
) -> Result<()> {
    let device = same_device(a, b)?;
    check_same_placement(out, a)?;
    let sig = OpSignature {
        kind: OpKind::Binary(op),
        inputs: vec![tensor_sig(a)?, tensor_sig(b)?],
        output_memory: required_memory(out)?,
        attrs: OpAttrs::None,
        compute: opts.compute,
    };
    dispatch(
        &device,
        sig,
        vec![Arc::clone(a.buffer()?), Arc::clone(b.buffer()?)],
        out,
        opts,
    )
}

fn unary(op: UnaryOp, a: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    let device = a.device()?.clone();
    let out = Tensor::allocate_on_device(
        a.shape(),
        a.dtype(),
        a.layout(),
        required_memory(a)?,
        &device,
    )?;
    unary_into(op, a, &out, opts)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// matmul
// ---------------------------------------------------------------------------

/// Batched matrix multiplication over the last two dims
pub fn matmul(a: &Tensor, b: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    let device = same_device(a, b)?;
    let out_shape = matmul_out_shape(a, b)?;
    let memory = opts
        .output_memory
        .clone()
        .unwrap_or(required_memory(a)?);
    let out = Tensor::allocate_on_device(&out_shape, a.dtype(), a.layout(), memory, &device)?;
    matmul_into(a, b, &out, opts)?;
    Ok(out)
}

/// Matmul into a pre-allocated output
pub fn matmul_into(a: &Tensor, b: &Tensor, out: &Tensor, opts: &DispatchOptions) -> Result<()> {
    let device = same_device(a, b)?;
    let expected = matmul_out_shape(a, b)?;
    if out.shape() != expected.as_slice() {
        return Err(Error::shape_mismatch(&expected, out.shape()));
    }
    let sig = OpSignature {
        kind: OpKind::Matmul,
        inputs: vec![tensor_sig(a)?, tensor_sig(b)?],
        output_memory: required_memory(out)?,
        attrs: OpAttrs::None,
        compute: opts.compute,
    };
    dispatch(
        &device,
        sig,
        vec![Arc::clone(a.buffer()?), Arc::clone(b.buffer()?)],
        out,
        opts,
    )
}

fn matmul_out_shape(a: &Tensor, b: &Tensor) -> Result<Vec<usize>> {
    if a.shape().len() < 2 || b.shape().len() < 2 {
        return Err(Error::invalid_argument(
            "input",
            "matmul inputs need at least 2 dims",
        ));
    }
    let mut out = a.shape().to_vec();
    let n = b.shape()[b.shape().len() - 1];
    *out.last_mut().unwrap() = n;
    Ok(out)
}

// ---------------------------------------------------------------------------
// transpose / reduce / layout conversion
// ---------------------------------------------------------------------------

/// Swap two logical dimensions
pub fn transpose(a: &Tensor, dim0: isize, dim1: isize, opts: &DispatchOptions) -> Result<Tensor> {
    let device = a.device()?.clone();
    let ndim = a.shape().len();
    let d0 = shape_util::normalize_dim(dim0, ndim)?;
    let d1 = shape_util::normalize_dim(dim1, ndim)?;
    let mut out_shape = a.shape().to_vec();
    out_shape.swap(d0, d1);
    let memory = opts
        .output_memory
        .clone()
        .unwrap_or(required_memory(a)?);
    let out = Tensor::allocate_on_device(&out_shape, a.dtype(), a.layout(), memory, &device)?;
    let sig = OpSignature {
        kind: OpKind::Transpose,
        inputs: vec![tensor_sig(a)?],
        output_memory: required_memory(&out)?,
        attrs: OpAttrs::TransposeDims(d0, d1),
        compute: opts.compute,
    };
    dispatch(&device, sig, vec![Arc::clone(a.buffer()?)], &out, opts)?;
    Ok(out)
}

/// Sum along a dimension, keeping it as size 1
pub fn reduce_sum(a: &Tensor, dim: isize, opts: &DispatchOptions) -> Result<Tensor> {
    reduce(ReduceOp::Sum, a, dim, opts)
}

/// Mean along a dimension, keeping it as size 1
pub fn reduce_mean(a: &Tensor, dim: isize, opts: &DispatchOptions) -> Result<Tensor> {
    reduce(ReduceOp::Mean, a, dim, opts)
}

/// Max along a dimension, keeping it as size 1
pub fn reduce_max(a: &Tensor, dim: isize, opts: &DispatchOptions) -> Result<Tensor> {
    reduce(ReduceOp::Max, a, dim, opts)
}

fn reduce(op: ReduceOp, a: &Tensor, dim: isize, opts: &DispatchOptions) -> Result<Tensor> {
    let device = a.device()?.clone();
    let ndim = a.shape().len();
    let d = shape_util::normalize_dim(dim, ndim)?;
    let mut out_shape = a.shape().to_vec();
    out_shape[d] = 1;
    let memory = opts
        .output_memory
        .clone()
        .unwrap_or(required_memory(a)?);
    let out = Tensor::allocate_on_device(&out_shape, a.dtype(), a.layout(), memory, &device)?;
    let sig = OpSignature {
        kind: OpKind::Reduce(op),
        inputs: vec![tensor_sig(a)?],
        output_memory: required_memory(&out)?,
        attrs: OpAttrs::ReduceDim(d),
        compute: opts.compute,
    };
    dispatch(&device, sig, vec![Arc::clone(a.buffer()?)], &out, opts)?;
    Ok(out)
}

/// Convert row-major pages to tiled pages on device
pub fn tilize(a: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    layout_convert(OpKind::Tilize, a, PageLayout::Tile, opts)
}

/// Convert tiled pages to row-major pages on device
pub fn untilize(a: &Tensor, opts: &DispatchOptions) -> Result<Tensor> {
    layout_convert(OpKind::Untilize, a, PageLayout::RowMajor, opts)
}

fn layout_convert(
    kind: OpKind,
    a: &Tensor,
    target: PageLayout,
    opts: &DispatchOptions,
) -> Result<Tensor> {
    let device = a.device()?.clone();
    let memory = opts
        .output_memory
        .clone()
        .unwrap_or(required_memory(a)?);
    let out = Tensor::allocate_on_device(a.shape(), a.dtype(), target, memory, &device)?;
    let sig = OpSignature {
        kind,
        inputs: vec![tensor_sig(a)?],
        output_memory: required_memory(&out)?,
        attrs: OpAttrs::None,
        compute: opts.compute,
    };
    dispatch(&device, sig, vec![Arc::clone(a.buffer()?)], &out, opts)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// sharding data movement
// ---------------------------------------------------------------------------

/// Repartition an interleaved tensor onto cores per a shard spec
pub fn interleaved_to_sharded(
    a: &Tensor,
    spec: ShardSpec,
    scheme: TensorMemoryLayout,
    buffer_type: BufferType,
    opts: &DispatchOptions,
) -> Result<Tensor> {
    let memory = MemoryConfig::sharded(scheme, buffer_type, spec);
    movement_op(OpKind::InterleavedToSharded, a, memory, opts)
}

/// Gather a sharded tensor back to an interleaved buffer
pub fn sharded_to_interleaved(
    a: &Tensor,
    memory: MemoryConfig,
    opts: &DispatchOptions,
) -> Result<Tensor> {
    movement_op(OpKind::ShardedToInterleaved, a, memory, opts)
}

/// Repartition a sharded tensor onto a different shard geometry
pub fn reshard(a: &Tensor, memory: MemoryConfig, opts: &DispatchOptions) -> Result<Tensor> {
    movement_op(OpKind::Reshard, a, memory, opts)
}

/// Reshard into a pre-allocated destination tensor
///
/// The destination keeps its buffer address, which is what trace capture
/// requires of every tensor it touches.
pub fn reshard_into(a: &Tensor, out: &Tensor, opts: &DispatchOptions) -> Result<()> {
    let device = same_device(a, out)?;
    if out.shape() != a.shape() {
        return Err(Error::shape_mismatch(a.shape(), out.shape()));
    }
    let sig = OpSignature {
        kind: OpKind::Reshard,
        inputs: vec![tensor_sig(a)?],
        output_memory: required_memory(out)?,
        attrs: OpAttrs::None,
        compute: opts.compute,
    };
    dispatch(&device, sig, vec![Arc::clone(a.buffer()?)], out, opts)
}

fn movement_op(
    kind: OpKind,
    a: &Tensor,
    memory: MemoryConfig,
    opts: &DispatchOptions,
) -> Result<Tensor> {
    let device = a.device()?.clone();
    let out = Tensor::allocate_on_device(a.shape(), a.dtype(), a.layout(), memory, &device)?;
    let sig = OpSignature {
        kind,
        inputs: vec![tensor_sig(a)?],
        output_memory: required_memory(&out)?,
        attrs: OpAttrs::None,
        compute: opts.compute,
    };
    dispatch(&device, sig, vec![Arc::clone(a.buffer()?)], &out, opts)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// dispatch plumbing
// ---------------------------------------------------------------------------

fn tensor_sig(t: &Tensor) -> Result<TensorSig> {
    Ok(TensorSig {
        shape: t.shape().iter().copied().collect(),
        dtype: t.dtype(),
        layout: t.layout(),
        memory: required_memory(t)?,
    })
}

fn required_memory(t: &Tensor) -> Result<MemoryConfig> {
    t.memory_config()
        .cloned()
        .ok_or_else(|| Error::invalid_argument("tensor", "host tensor in a device op"))
}

fn same_device(a: &Tensor, b: &Tensor) -> Result<Device> {
    let da = a.device()?;
    let db = b.device()?;
    if !Arc::ptr_eq(&da.shared, &db.shared) {
        return Err(Error::DeviceMismatch);
    }
    Ok(da.clone())
}

fn check_same_placement(out: &Tensor, like: &Tensor) -> Result<()> {
    if out.shape() != like.shape() {
        return Err(Error::shape_mismatch(like.shape(), out.shape()));
    }
    if out.dtype() != like.dtype() {
        return Err(Error::DTypeMismatch {
            lhs: like.dtype(),
            rhs: out.dtype(),
        });
    }
    if out.layout() != like.layout() {
        return Err(Error::invalid_layout("output page layout mismatch"));
    }
    Ok(())
}

fn dispatch(
    device: &Device,
    sig: OpSignature,
    inputs: Vec<Arc<crate::device::DeviceBuffer>>,
    out: &Tensor,
    opts: &DispatchOptions,
) -> Result<()> {
    let program = device
        .program_cache()
        .get_or_compile(sig, device.arch().num_cores())?;
    device.submit(
        opts.cq_id,
        Command::Execute {
            program,
            binding: ProgramBinding {
                inputs,
                output: Arc::clone(out.buffer()?),
            },
        },
        opts.mode,
    )
}
