//! Multi-device mesh coordination
//!
//! A [`MeshDevice`] groups devices into one logical distributed target with a
//! cluster shape. Tensors distribute across the mesh by sharding or
//! replication and compose back with concatenation; collectives operate on
//! already-distributed tensors.

mod collective;
mod distribute;

pub use collective::{all_gather, all_reduce, reduce_scatter};
pub use distribute::{
    concat_2d_mesh_to_tensor, concat_mesh_to_tensor, replicate_tensor_to_mesh,
    shard_tensor_to_2d_mesh, shard_tensor_to_mesh,
};

use crate::device::{Device, DeviceConfig};
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use std::time::Duration;

/// Cluster shape of a mesh: a 2D grid of chips
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshShape {
    /// Chip rows
    pub rows: usize,
    /// Chip columns
    pub cols: usize,
}

impl MeshShape {
    /// Create a cluster shape
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Total devices in the cluster
    pub const fn num_devices(&self) -> usize {
        self.rows * self.cols
    }
}

/// An ordered collection of devices acting as one distributed target
pub struct MeshDevice {
    devices: Vec<Device>,
    shape: MeshShape,
}

impl MeshDevice {
    /// Open all devices of a mesh with a shared configuration
    pub fn open(device_ids: &[usize], shape: MeshShape, config: DeviceConfig) -> Result<Self> {
        if device_ids.len() != shape.num_devices() {
            return Err(Error::invalid_argument(
                "device_ids",
                format!(
                    "{} ids for a {}x{} cluster",
                    device_ids.len(),
                    shape.rows,
                    shape.cols
                ),
            ));
        }
        let devices = device_ids
            .iter()
            .map(|&id| Device::open(id, config.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices, shape })
    }

    /// Cluster shape
    pub fn shape(&self) -> MeshShape {
        self.shape
    }

    /// Number of devices
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Device at a mesh index (row-major over the cluster)
    pub fn device(&self, index: usize) -> &Device {
        &self.devices[index]
    }

    /// All devices in mesh order
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Synchronize every device in the mesh
    pub fn synchronize(&self) -> Result<()> {
        for device in &self.devices {
            device.synchronize()?;
        }
        Ok(())
    }

    /// Synchronize with a per-device watchdog deadline
    pub fn synchronize_timeout(&self, timeout: Duration) -> Result<()> {
        for device in &self.devices {
            device.synchronize_timeout(timeout)?;
        }
        Ok(())
    }

    /// Close every device in the mesh
    pub fn close(&self) -> Result<()> {
        for device in &self.devices {
            device.close()?;
        }
        Ok(())
    }
}

/// Per-device shards of one logically distributed tensor
pub struct MeshTensor {
    shards: Vec<Tensor>,
}

impl MeshTensor {
    /// Aggregate per-device tensors into a mesh tensor
    ///
    /// Shard order must follow mesh order.
    pub fn aggregate(shards: Vec<Tensor>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::invalid_argument("shards", "empty mesh tensor"));
        }
        for shard in &shards {
            shard.device()?;
        }
        Ok(Self { shards })
    }

    /// Per-device tensors in mesh order
    pub fn device_tensors(&self) -> &[Tensor] {
        &self.shards
    }

    /// Number of shards
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}
