//! Operator signatures, compiled programs, and the per-device program cache
//!
//! Dispatch follows a create/rebind split: on a cache miss the program
//! factory compiles a structure-dependent plan (work split, reorder runs,
//! kernel variant) and inserts it; on a hit the cached program is reused and
//! only the runtime buffer addresses are rebound. Signatures capture
//! everything that affects compiled code — shapes, dtypes, page layouts,
//! memory configs, attributes, fidelity — and nothing else, so a hit is
//! guaranteed to behave identically to the miss that created the entry.

use super::compute::ComputeKernelConfig;
use super::kernels;
use crate::device::DeviceBuffer;
use crate::dtype::DType;
use crate::error::Result;
use crate::memory::{CopyRun, MemoryConfig};
use crate::tensor::{PageLayout, Shape};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Element-wise binary operations
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// a + b
    Add,
    /// a - b
    Sub,
    /// a * b
    Mul,
}

/// Element-wise unary operations
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// e^a
    Exp,
    /// max(a, 0)
    Relu,
    /// sqrt(a)
    Sqrt,
}

/// Reduction operations
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Sum of elements
    Sum,
    /// Arithmetic mean
    Mean,
    /// Maximum element
    Max,
}

/// The sealed set of device operations
///
/// Every operator is a tagged variant with a typed signature extraction and
/// a program factory; there is no open registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Element-wise binary op
    Binary(BinaryOp),
    /// Element-wise unary op
    Unary(UnaryOp),
    /// Matrix multiplication over the last two dims
    Matmul,
    /// Swap two logical dimensions
    Transpose,
    /// Reduce along one dimension
    Reduce(ReduceOp),
    /// Row-major to tiled page layout
    Tilize,
    /// Tiled to row-major page layout
    Untilize,
    /// Interleaved to sharded data movement
    InterleavedToSharded,
    /// Sharded to interleaved data movement
    ShardedToInterleaved,
    /// Sharded to sharded data movement
    Reshard,
}

impl OpKind {
    /// Stable operation name (profiler and error messages)
    pub const fn name(self) -> &'static str {
        match self {
            Self::Binary(BinaryOp::Add) => "add",
            Self::Binary(BinaryOp::Sub) => "sub",
            Self::Binary(BinaryOp::Mul) => "mul",
            Self::Unary(UnaryOp::Exp) => "exp",
            Self::Unary(UnaryOp::Relu) => "relu",
            Self::Unary(UnaryOp::Sqrt) => "sqrt",
            Self::Matmul => "matmul",
            Self::Transpose => "transpose",
            Self::Reduce(ReduceOp::Sum) => "reduce_sum",
            Self::Reduce(ReduceOp::Mean) => "reduce_mean",
            Self::Reduce(ReduceOp::Max) => "reduce_max",
            Self::Tilize => "tilize",
            Self::Untilize => "untilize",
            Self::InterleavedToSharded => "interleaved_to_sharded",
            Self::ShardedToInterleaved => "sharded_to_interleaved",
            Self::Reshard => "reshard",
        }
    }
}

/// Structural description of one input tensor
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorSig {
    /// Logical shape
    pub shape: Shape,
    /// Element type
    pub dtype: DType,
    /// Page layout
    pub layout: PageLayout,
    /// Memory configuration
    pub memory: MemoryConfig,
}

/// Structural attributes that shape the compiled program
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpAttrs {
    /// No extra attributes
    None,
    /// Transpose dimension pair (normalized)
    TransposeDims(usize, usize),
    /// Reduction dimension (normalized)
    ReduceDim(usize),
}

/// The program cache key: everything that affects compiled code, nothing
/// that doesn't (no data values, no buffer addresses)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OpSignature {
    /// Which operator
    pub kind: OpKind,
    /// Per-input structure
    pub inputs: Vec<TensorSig>,
    /// Output memory configuration
    pub output_memory: MemoryConfig,
    /// Structural attributes
    pub attrs: OpAttrs,
    /// Fidelity/accumulation knobs
    pub compute: ComputeKernelConfig,
}

/// Structure-dependent execution plan, the product of compilation
///
/// Plans hold no data values and no addresses; reorder run lists are in
/// buffer-relative byte offsets.
#[derive(Clone, Debug)]
pub(crate) enum KernelPlan {
    /// Element-wise binary over buffer order
    Binary {
        op: BinaryOp,
        dtype: DType,
        elems: usize,
    },
    /// Element-wise unary over buffer order
    Unary {
        op: UnaryOp,
        dtype: DType,
        elems: usize,
    },
    /// Batched matmul over the last two dims
    Matmul {
        batch: usize,
        m: usize,
        k: usize,
        n: usize,
        dtype: DType,
        layout: PageLayout,
        compute: ComputeKernelConfig,
    },
    /// Dimension swap in the canonical domain
    Transpose {
        shape: Shape,
        d0: usize,
        d1: usize,
        dtype: DType,
        layout: PageLayout,
    },
    /// Reduce one dimension, keeping it as size 1
    Reduce {
        op: ReduceOp,
        shape: Shape,
        dim: usize,
        dtype: DType,
        fp32_acc: bool,
    },
    /// Page layout conversion between row-major and tiled
    LayoutConvert {
        to_tiled: bool,
        rows: usize,
        cols: usize,
        dtype: DType,
    },
    /// Single-step byte reorder (interleaved <-> sharded)
    Reorder { runs: Vec<CopyRun> },
    /// Two-step reorder through a canonical intermediate (reshard)
    Reshard {
        to_canonical: Vec<CopyRun>,
        canonical_bytes: usize,
        to_sharded: Vec<CopyRun>,
    },
}

/// Runtime addresses bound to a compiled program for one invocation
///
/// This is the rebind half of the create/rebind split: a cache hit reuses
/// the plan and swaps only these references.
#[derive(Clone)]
pub struct ProgramBinding {
    /// Input buffers in signature order
    pub inputs: Vec<Arc<DeviceBuffer>>,
    /// Output buffer
    pub output: Arc<DeviceBuffer>,
}

/// A compiled device program
pub struct CompiledProgram {
    signature: OpSignature,
    plan: KernelPlan,
    core_count: usize,
}

impl CompiledProgram {
    /// Compile a program from its signature
    ///
    /// `grid_cores` is the device's compute-core count, used for the work
    /// split; it is a device constant, not part of the signature.
    pub(crate) fn compile(signature: OpSignature, grid_cores: usize) -> Result<Self> {
        let plan = kernels::build_plan(&signature)?;
        let core_count = kernels::core_count(&plan, grid_cores);
        Ok(Self {
            signature,
            plan,
            core_count,
        })
    }

    /// The signature this program was compiled from
    pub fn signature(&self) -> &OpSignature {
        &self.signature
    }

    /// Operation name
    pub fn op_name(&self) -> &'static str {
        self.signature.kind.name()
    }

    /// Cores the program occupies
    pub fn core_count(&self) -> usize {
        self.core_count
    }

    /// Run the program against bound buffers (on a queue worker)
    pub(crate) fn execute(&self, binding: &ProgramBinding) -> Result<()> {
        kernels::execute(&self.plan, binding)
    }
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("op", &self.op_name())
            .field("core_count", &self.core_count)
            .finish()
    }
}

/// Per-device compiled-program cache
///
/// Keyed purely by [`OpSignature`]; repeated calls with identical structure
/// reuse one entry regardless of tensor values. Insertions serialize behind
/// the lock, so concurrent host threads may dispatch to one device.
pub struct ProgramCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<OpSignature, Arc<CompiledProgram>>,
    hits: u64,
    misses: u64,
    enabled: bool,
}

impl ProgramCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                hits: 0,
                misses: 0,
                enabled: true,
            }),
        }
    }

    /// Look up or compile the program for a signature
    pub(crate) fn get_or_compile(
        &self,
        signature: OpSignature,
        grid_cores: usize,
    ) -> Result<Arc<CompiledProgram>> {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return Ok(Arc::new(CompiledProgram::compile(signature, grid_cores)?));
        }
        if let Some(program) = inner.map.get(&signature).map(Arc::clone) {
            inner.hits += 1;
            tracing::trace!(op = signature.kind.name(), "program cache hit");
            return Ok(program);
        }
        inner.misses += 1;
        tracing::debug!(op = signature.kind.name(), "program cache miss, compiling");
        let program = Arc::new(CompiledProgram::compile(signature.clone(), grid_cores)?);
        inner.map.insert(signature, Arc::clone(&program));
        Ok(program)
    }

    /// Number of distinct compiled entries
    pub fn num_entries(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Cache hits since open
    pub fn hits(&self) -> u64 {
        self.inner.lock().hits
    }

    /// Cache misses since open
    pub fn misses(&self) -> u64 {
        self.inner.lock().misses
    }

    /// Whether caching is enabled
    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Enable caching
    pub fn enable(&self) {
        self.inner.lock().enabled = true;
    }

    /// Disable caching and drop all entries
    pub fn disable_and_clear(&self) {
        let mut inner = self.inner.lock();
        inner.enabled = false;
        inner.map.clear();
    }

    /// Drop all entries, keeping the enabled state
    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }
}
