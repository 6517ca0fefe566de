//! Tensor storage: host buffers and device-resident buffers

use crate::device::{Device, DeviceBuffer};
use std::sync::Arc;

/// Where a tensor's bytes live
///
/// Host storage is a plain refcounted byte buffer. Device storage binds a
/// refcounted [`DeviceBuffer`] to its owning [`Device`]; the backing address
/// range returns to the device allocator when the last reference drops.
#[derive(Clone)]
pub enum Storage {
    /// Host-resident bytes in the tensor's page-layout order
    Host(Arc<Vec<u8>>),
    /// Device-resident buffer
    Device(DeviceStorage),
}

/// Device-resident storage: buffer plus owning device handle
#[derive(Clone)]
pub struct DeviceStorage {
    pub(crate) buffer: Arc<DeviceBuffer>,
    pub(crate) device: Device,
}

impl Storage {
    /// Whether the storage is device-resident
    pub fn is_on_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(bytes) => f
                .debug_struct("Host")
                .field("bytes", &bytes.len())
                .field("refs", &Arc::strong_count(bytes))
                .finish(),
            Self::Device(ds) => f
                .debug_struct("Device")
                .field("device", &ds.device.id())
                .field("buffer", &ds.buffer)
                .finish(),
        }
    }
}
