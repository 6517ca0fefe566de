//! Core Tensor type

use super::layout::{tilize, untilize, PageLayout};
use super::shape::{self, Shape};
use super::storage::{DeviceStorage, Storage};
use crate::device::{Command, Device, ExecMode};
use crate::dtype::{buffer_elems, pack_from_f64, unpack_to_f64, DType, Element};
use crate::error::{Error, Result};
use crate::memory::{apply_runs, MemoryConfig, ShardLayout};
use std::sync::Arc;

/// N-dimensional array with an explicit page layout and storage placement
///
/// A tensor is either host-resident or bound to a device buffer with a
/// [`MemoryConfig`]. Device transfers are asynchronous with respect to the
/// issuing queue unless the blocking mode is used; reading a device tensor
/// before its producing commands complete requires synchronization.
///
/// Reshaping or resharding produces a new tensor; shard geometry is never
/// mutated in place.
#[derive(Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    layout: PageLayout,
    storage: Storage,
    memory: Option<MemoryConfig>,
}

impl Tensor {
    /// Create a host tensor from typed data, row-major pages
    pub fn from_slice<T: Element>(data: &[T], shape_dims: &[usize]) -> Result<Self> {
        let volume = shape::volume(shape_dims);
        if data.len() != volume {
            return Err(Error::ShapeMismatch {
                expected: shape_dims.to_vec(),
                got: vec![data.len()],
            });
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Ok(Self {
            shape: shape_dims.iter().copied().collect(),
            dtype: T::DTYPE,
            layout: PageLayout::RowMajor,
            storage: Storage::Host(Arc::new(bytes.to_vec())),
            memory: None,
        })
    }

    /// Create a host tensor from f32 data, quantizing to `dtype`
    ///
    /// Scalar targets produce row-major pages. Block-float targets require a
    /// tile-aligned shape and produce tiled pages directly, since blocks
    /// follow tile order.
    pub fn from_f32_slice(data: &[f32], shape_dims: &[usize], dtype: DType) -> Result<Self> {
        let volume = shape::volume(shape_dims);
        if data.len() != volume {
            return Err(Error::ShapeMismatch {
                expected: shape_dims.to_vec(),
                got: vec![data.len()],
            });
        }
        let values: Vec<f64> = data.iter().map(|&v| v as f64).collect();
        Self::from_f64_values(values, shape_dims, dtype)
    }

    /// Build a host tensor from workspace values in logical row-major order
    ///
    /// Block-float targets tilize first (blocks follow tile order).
    pub(crate) fn from_f64_values(
        values: Vec<f64>,
        shape_dims: &[usize],
        dtype: DType,
    ) -> Result<Self> {
        debug_assert_eq!(values.len(), shape::volume(shape_dims));
        let (layout, ordered) = if dtype.is_block_float() {
            PageLayout::Tile.validate(shape_dims)?;
            let rows = shape::flat_rows(shape_dims);
            let cols = shape::flat_cols(shape_dims);
            (PageLayout::Tile, tilize(&values, rows, cols))
        } else {
            (PageLayout::RowMajor, values)
        };
        Ok(Self {
            shape: shape_dims.iter().copied().collect(),
            dtype,
            layout,
            storage: Storage::Host(Arc::new(pack_from_f64(&ordered, dtype))),
            memory: None,
        })
    }

    /// Host tensor values as logical row-major f64 workspace values
    pub(crate) fn values_f64(&self) -> Result<Vec<f64>> {
        let bytes = self.host_bytes()?;
        let mut values = unpack_to_f64(bytes, self.dtype, buffer_elems(bytes.len(), self.dtype));
        values.truncate(self.volume());
        if self.layout == PageLayout::Tile {
            values = untilize(
                &values,
                shape::flat_rows(&self.shape),
                shape::flat_cols(&self.shape),
            );
        }
        Ok(values)
    }

    /// Logical shape
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type
    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Page layout
    #[inline]
    pub fn layout(&self) -> PageLayout {
        self.layout
    }

    /// Total element count
    #[inline]
    pub fn volume(&self) -> usize {
        shape::volume(&self.shape)
    }

    /// Memory config (device tensors only)
    #[inline]
    pub fn memory_config(&self) -> Option<&MemoryConfig> {
        self.memory.as_ref()
    }

    /// Whether the tensor is device-resident
    #[inline]
    pub fn is_on_device(&self) -> bool {
        self.storage.is_on_device()
    }

    /// The owning device of a device tensor
    pub fn device(&self) -> Result<&Device> {
        match &self.storage {
            Storage::Device(ds) => Ok(&ds.device),
            Storage::Host(_) => Err(Error::invalid_argument("tensor", "not on a device")),
        }
    }

    /// The backing device buffer of a device tensor
    pub(crate) fn buffer(&self) -> Result<&Arc<crate::device::DeviceBuffer>> {
        match &self.storage {
            Storage::Device(ds) => Ok(&ds.buffer),
            Storage::Host(_) => Err(Error::invalid_argument("tensor", "not on a device")),
        }
    }

    /// Device address of the backing buffer
    ///
    /// Stable for the buffer's lifetime; the trace-replay address contract
    /// is expressed in terms of this value.
    pub fn buffer_address(&self) -> Result<u64> {
        Ok(self.buffer()?.address())
    }

    /// Host bytes of a host tensor, in page-layout order
    pub(crate) fn host_bytes(&self) -> Result<&Arc<Vec<u8>>> {
        match &self.storage {
            Storage::Host(bytes) => Ok(bytes),
            Storage::Device(_) => Err(Error::invalid_argument("tensor", "not host-resident")),
        }
    }

    /// Convert a host tensor between page layouts
    ///
    /// Tiling requires tile-aligned extents; block-float tensors cannot
    /// leave tiled layout. Device tensors convert via the tilize/untilize
    /// ops instead.
    pub fn to_layout(&self, target: PageLayout) -> Result<Self> {
        let bytes = self.host_bytes()?;
        if target == self.layout {
            return Ok(self.clone());
        }
        if self.dtype.is_block_float() {
            return Err(Error::invalid_layout(format!(
                "{} tensors are tile-layout only",
                self.dtype
            )));
        }
        PageLayout::Tile.validate(&self.shape)?;
        let rows = shape::flat_rows(&self.shape);
        let cols = shape::flat_cols(&self.shape);
        let values = unpack_to_f64(bytes, self.dtype, self.volume());
        let ordered = match target {
            PageLayout::Tile => tilize(&values, rows, cols),
            PageLayout::RowMajor => untilize(&values, rows, cols),
        };
        Ok(Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            layout: target,
            storage: Storage::Host(Arc::new(pack_from_f64(&ordered, self.dtype))),
            memory: None,
        })
    }

    /// Reshape without moving data
    ///
    /// One dimension may be `-1`, inferred from the rest. Legal for host
    /// tensors and interleaved row-major device tensors (where the buffer
    /// order is shape-independent); tiled tensors must untilize first.
    pub fn reshape(&self, dims: &[isize]) -> Result<Self> {
        if self.layout == PageLayout::Tile {
            return Err(Error::invalid_layout(
                "reshape requires row-major pages; untilize first",
            ));
        }
        if let Some(memory) = &self.memory {
            if memory.is_sharded() {
                return Err(Error::invalid_layout(
                    "reshape of a sharded tensor; convert to interleaved first",
                ));
            }
        }
        let new_shape = shape::resolve_reshape(self.volume(), dims)?;
        Ok(Self {
            shape: new_shape,
            dtype: self.dtype,
            layout: self.layout,
            storage: self.storage.clone(),
            memory: self.memory.clone(),
        })
    }

    /// Move a host tensor to a device on queue 0, asynchronously
    pub fn to_device(&self, device: &Device, memory: MemoryConfig) -> Result<Self> {
        self.to_device_with(device, memory, 0, ExecMode::Async)
    }

    /// Move a host tensor to a device with explicit queue and mode
    pub fn to_device_with(
        &self,
        device: &Device,
        memory: MemoryConfig,
        cq_id: usize,
        mode: ExecMode,
    ) -> Result<Self> {
        let host = self.host_bytes()?;
        self.layout.validate(&self.shape)?;
        if self.dtype.is_block_float() && self.layout != PageLayout::Tile {
            return Err(Error::invalid_layout(format!(
                "{} tensors are tile-layout only",
                self.dtype
            )));
        }

        let arranged = arrange_for_device(host, &self.shape, self.layout, self.dtype, &memory, device)?;
        let buffer = device.allocate_buffer(arranged.len(), memory.buffer_type)?;
        device.submit(
            cq_id,
            Command::WriteBuffer {
                dst: Arc::clone(&buffer),
                data: Arc::new(arranged),
            },
            mode,
        )?;
        Ok(Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            layout: self.layout,
            storage: Storage::Device(DeviceStorage {
                buffer,
                device: device.clone(),
            }),
            memory: Some(memory),
        })
    }

    /// Allocate a zeroed device tensor without transferring data
    ///
    /// This is the pre-allocation entry point the trace-capture protocol
    /// requires: outputs written during a captured sequence must already
    /// exist at fixed addresses before capture begins.
    pub fn allocate_on_device(
        shape_dims: &[usize],
        dtype: DType,
        layout: PageLayout,
        memory: MemoryConfig,
        device: &Device,
    ) -> Result<Self> {
        layout.validate(shape_dims)?;
        if dtype.is_block_float() && layout != PageLayout::Tile {
            return Err(Error::invalid_layout(format!(
                "{dtype} tensors are tile-layout only"
            )));
        }
        let bytes = device_buffer_bytes(shape_dims, layout, dtype, &memory, device)?;
        let buffer = device.allocate_buffer(bytes, memory.buffer_type)?;
        Ok(Self {
            shape: shape_dims.iter().copied().collect(),
            dtype,
            layout,
            storage: Storage::Device(DeviceStorage {
                buffer,
                device: device.clone(),
            }),
            memory: Some(memory),
        })
    }

    /// Write a host tensor's data into this pre-allocated device tensor
    ///
    /// The transfer is enqueued on `cq_id`; the destination buffer address
    /// is unchanged, which is what trace replay loops rely on.
    pub fn copy_from_host(&self, host: &Tensor, cq_id: usize) -> Result<()> {
        let device = self.device()?;
        let memory = self
            .memory
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("tensor", "missing memory config"))?;
        if host.shape != self.shape {
            return Err(Error::shape_mismatch(&self.shape, &host.shape));
        }
        if host.dtype != self.dtype {
            return Err(Error::DTypeMismatch {
                lhs: self.dtype,
                rhs: host.dtype,
            });
        }
        if host.layout != self.layout {
            return Err(Error::invalid_layout("page layout mismatch in host copy"));
        }
        let bytes = host.host_bytes()?;
        let arranged =
            arrange_for_device(bytes, &self.shape, self.layout, self.dtype, memory, device)?;
        device.submit(
            cq_id,
            Command::WriteBuffer {
                dst: Arc::clone(self.buffer()?),
                data: Arc::new(arranged),
            },
            ExecMode::Async,
        )
    }

    /// Read a device tensor back to the host via queue 0
    ///
    /// The read is ordered behind everything previously enqueued on the
    /// queue, so it observes completed results.
    pub fn to_host(&self) -> Result<Self> {
        self.to_host_on(0)
    }

    /// Read back via an explicit queue
    pub fn to_host_on(&self, cq_id: usize) -> Result<Self> {
        let device = self.device()?.clone();
        let memory = self
            .memory
            .clone()
            .ok_or_else(|| Error::invalid_argument("tensor", "missing memory config"))?;
        let raw = device.read_buffer(cq_id, self.buffer()?)?;

        let canonical = if memory.is_sharded() {
            let spec = memory
                .shard_spec
                .as_ref()
                .ok_or_else(|| Error::invalid_shard_spec("sharded config without shard spec"))?;
            let shard_layout =
                ShardLayout::build(&self.shape, self.layout, self.dtype, memory.layout, spec)?;
            let mut out = vec![0u8; self.dtype.buffer_bytes(self.volume())];
            apply_runs(&shard_layout.runs_to_canonical(), &raw, &mut out);
            out
        } else {
            raw
        };

        Ok(Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            layout: self.layout,
            storage: Storage::Host(Arc::new(canonical)),
            memory: None,
        })
    }

    /// Host tensor values as logical row-major f32
    ///
    /// Works for every dtype and page layout; tiled pages are untilized
    /// first. The usual endpoint of a test's readback path.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        Ok(self.values_f64()?.into_iter().map(|v| v as f32).collect())
    }

    /// Host tensor values as typed elements in page-layout order
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::DTypeMismatch {
                lhs: self.dtype,
                rhs: T::DTYPE,
            });
        }
        let bytes = self.host_bytes()?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    /// Explicitly release a device tensor's buffer
    ///
    /// The pools are fixed-size, so long-lived tensors that are no longer
    /// needed should be released (or dropped) before they exhaust memory.
    pub fn deallocate(self) -> Result<()> {
        self.buffer()?.release();
        Ok(())
    }
}

/// Compute a device tensor's buffer size for a memory config
fn device_buffer_bytes(
    shape_dims: &[usize],
    layout: PageLayout,
    dtype: DType,
    memory: &MemoryConfig,
    device: &Device,
) -> Result<usize> {
    if let Some(spec) = &memory.shard_spec {
        if !spec.grid.fits_within(device.core_grid()) {
            return Err(Error::invalid_shard_spec(format!(
                "shard grid exceeds the device grid {}",
                device.core_grid()
            )));
        }
        let shard_layout = ShardLayout::build(shape_dims, layout, dtype, memory.layout, spec)?;
        Ok(shard_layout.buffer_bytes())
    } else if memory.is_sharded() {
        Err(Error::invalid_shard_spec(
            "sharded memory config requires a shard spec",
        ))
    } else {
        Ok(dtype.buffer_bytes(shape::volume(shape_dims)))
    }
}

/// Arrange canonical host bytes into the device buffer order for a config
fn arrange_for_device(
    host: &[u8],
    shape_dims: &[usize],
    layout: PageLayout,
    dtype: DType,
    memory: &MemoryConfig,
    device: &Device,
) -> Result<Vec<u8>> {
    if memory.is_sharded() {
        let spec = memory
            .shard_spec
            .as_ref()
            .ok_or_else(|| Error::invalid_shard_spec("sharded memory config requires a shard spec"))?;
        if !spec.grid.fits_within(device.core_grid()) {
            return Err(Error::invalid_shard_spec(format!(
                "shard grid exceeds the device grid {}",
                device.core_grid()
            )));
        }
        let shard_layout = ShardLayout::build(shape_dims, layout, dtype, memory.layout, spec)?;
        let mut out = vec![0u8; shard_layout.buffer_bytes()];
        apply_runs(&shard_layout.runs_to_sharded(), host, &mut out);
        Ok(out)
    } else {
        Ok(host.to_vec())
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape.as_slice())
            .field("dtype", &self.dtype)
            .field("layout", &self.layout)
            .field("storage", &self.storage)
            .finish()
    }
}
