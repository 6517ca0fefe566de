//! Error types for tilr

use crate::dtype::DType;
use crate::memory::BufferType;
use thiserror::Error;

/// Result type alias using tilr's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tilr operations
///
/// The taxonomy follows the runtime's failure model: configuration errors are
/// raised synchronously before any device work is enqueued, capacity errors
/// when an allocation cannot be satisfied, and timeouts only from the
/// host-side watchdog. A hung device cannot be cancelled, only reset.
#[derive(Error, Debug)]
pub enum Error {
    /// Shape mismatch in an operation
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// Invalid dimension index
    #[error("Invalid dimension {dim} for tensor with {ndim} dimensions")]
    InvalidDimension {
        /// The invalid dimension
        dim: isize,
        /// Number of dimensions
        ndim: usize,
    },

    /// Unsupported dtype for an operation
    #[error("Unsupported dtype {dtype:?} for operation '{op}'")]
    UnsupportedDType {
        /// The unsupported dtype
        dtype: DType,
        /// The operation name
        op: &'static str,
    },

    /// DType mismatch between operands
    #[error("DType mismatch: {lhs:?} vs {rhs:?}")]
    DTypeMismatch {
        /// Left-hand side dtype
        lhs: DType,
        /// Right-hand side dtype
        rhs: DType,
    },

    /// Device mismatch between operands
    #[error("Device mismatch: tensors must be on the same device")]
    DeviceMismatch,

    /// Illegal page-layout / dtype / shape combination
    #[error("Invalid layout: {reason}")]
    InvalidLayout {
        /// Reason the layout is illegal
        reason: String,
    },

    /// Illegal shard geometry
    #[error("Invalid shard spec: {reason}")]
    InvalidShardSpec {
        /// Reason the shard spec is illegal
        reason: String,
    },

    /// Queue id outside the device's configured hardware command queues
    #[error("Invalid command queue {cq_id}: device has {num_queues} queues")]
    InvalidQueue {
        /// The requested queue id
        cq_id: usize,
        /// Number of queues the device was opened with
        num_queues: usize,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Device memory pool exhaustion
    #[error(
        "Out of memory: not enough space to allocate {requested} bytes in {buffer_type:?} \
         ({available} bytes available)"
    )]
    OutOfMemory {
        /// Requested size in bytes
        requested: usize,
        /// Largest satisfiable size in bytes
        available: usize,
        /// The memory pool that was exhausted
        buffer_type: BufferType,
    },

    /// Allocation attempted while a trace capture is active
    #[error("Allocation is forbidden during trace capture; pre-allocate tensors before capture")]
    AllocationDuringCapture,

    /// Recorded commands exceed the device's trace region
    #[error("Trace region exhausted: trace needs {needed} bytes, region holds {capacity}")]
    TraceRegionExhausted {
        /// Bytes the captured trace requires
        needed: usize,
        /// Configured trace region size
        capacity: usize,
    },

    /// Trace id does not name a captured trace on this device
    #[error("Trace {trace_id} not found on device")]
    TraceNotFound {
        /// The unknown trace id
        trace_id: u32,
    },

    /// A buffer referenced by a trace is no longer live at its captured address
    #[error(
        "Trace address mismatch: buffer captured at {addr:#x} is no longer allocated there; \
         replaying would be undefined"
    )]
    TraceAddressMismatch {
        /// The captured device address
        addr: u64,
    },

    /// Host-side watchdog expired while waiting for the device
    ///
    /// The only recovery is a device reset; enqueued commands cannot be
    /// cancelled.
    #[error("Timeout after {waited_ms} ms waiting for device {device_id}")]
    Timeout {
        /// Device that failed to drain
        device_id: usize,
        /// Milliseconds waited before giving up
        waited_ms: u64,
    },

    /// Operation on a device that has been closed
    #[error("Device {device_id} is closed")]
    DeviceClosed {
        /// The closed device's id
        device_id: usize,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Create an unsupported dtype error
    pub fn unsupported_dtype(dtype: DType, op: &'static str) -> Self {
        Self::UnsupportedDType { dtype, op }
    }

    /// Create an invalid layout error
    pub fn invalid_layout(reason: impl Into<String>) -> Self {
        Self::InvalidLayout {
            reason: reason.into(),
        }
    }

    /// Create an invalid shard spec error
    pub fn invalid_shard_spec(reason: impl Into<String>) -> Self {
        Self::InvalidShardSpec {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }
}
