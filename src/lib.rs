//! # tilr
//!
//! **Tiled-tensor execution runtime with layout-aware dispatch, program
//! caching, and trace replay.**
//!
//! tilr models an accelerator built from a grid of compute cores with tiled
//! on-chip memory: tensors carry an explicit page layout (row-major or 32x32
//! tiles) and a memory configuration describing how their storage spreads
//! across cores and banks. Operators compile to programs cached by
//! structural signature, execute through per-device FIFO command queues, and
//! can be captured into replayable traces. Device groups compose into meshes
//! with collective operations.
//!
//! The device itself is simulated in-process — deterministic kernel
//! emulation over real fixed-capacity memory pools, worker-thread command
//! queues, and a real allocator — so every contract (cache hits, shard
//! round trips, event ordering, trace address stability) is exercised for
//! real rather than stubbed.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tilr::prelude::*;
//!
//! let device = Device::open(0, DeviceConfig::default())?;
//! let a = Tensor::from_slice(&[1.0f32; 1024], &[32, 32])?
//!     .to_device(&device, MemoryConfig::dram_interleaved())?;
//! let b = ops::add(&a, &a, &DispatchOptions::default())?;
//! let host = b.to_host()?;
//! device.close()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `rayon` (default): multi-threaded kernel emulation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod device;
pub mod dtype;
pub mod error;
pub mod memory;
pub mod mesh;
pub mod ops;
pub mod profiler;
pub mod tensor;
pub mod trace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::device::{Arch, Device, DeviceConfig, Event, ExecMode};
    pub use crate::dtype::DType;
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        BufferType, CoreCoord, CoreRange, CoreRangeSet, MemoryConfig, ShardOrientation, ShardSpec,
        TensorMemoryLayout,
    };
    pub use crate::mesh::{MeshDevice, MeshShape, MeshTensor};
    pub use crate::ops::{self, ComputeKernelConfig, DispatchOptions, MathFidelity, ReduceOp};
    pub use crate::tensor::{PageLayout, Tensor};
    pub use crate::trace::{begin_trace_capture, end_trace_capture, execute_trace, TraceId};
}
