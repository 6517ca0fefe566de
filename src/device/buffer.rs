//! Device buffers: allocator-backed byte regions with stable addresses

use super::DeviceShared;
use crate::error::{Error, Result};
use crate::memory::BufferType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

/// Raw backing bytes for one device buffer
///
/// Queue worker threads read and write buffer contents while host threads
/// hold references to the same buffer, so access goes through raw-pointer
/// copies rather than slices. Ordering between conflicting accesses is the
/// caller's responsibility via queue events; unordered concurrent access to
/// the same buffer is a data race by design, mirroring the hardware.
struct SharedBytes {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for SharedBytes {}
unsafe impl Sync for SharedBytes {}

impl SharedBytes {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self { ptr, len }
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "device buffer read OOB");
        // SAFETY: bounds checked above; ptr owns len bytes for self's lifetime
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "device buffer write OOB");
        // SAFETY: bounds checked above; ptr owns len bytes for self's lifetime
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
        }
    }
}

impl Drop for SharedBytes {
    fn drop(&mut self) {
        // SAFETY: ptr came from Box::into_raw with this exact length
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

/// One allocated region of device memory
///
/// The address is stable for the buffer's lifetime; trace replay depends on
/// that. Dropping the last reference returns the address range to the
/// device's allocator.
pub struct DeviceBuffer {
    address: u64,
    size: usize,
    buffer_type: BufferType,
    device_id: usize,
    data: SharedBytes,
    device: Weak<DeviceShared>,
    deallocated: AtomicBool,
}

impl DeviceBuffer {
    pub(crate) fn new(
        address: u64,
        size: usize,
        buffer_type: BufferType,
        device_id: usize,
        device: Weak<DeviceShared>,
    ) -> Self {
        Self {
            address,
            size,
            buffer_type,
            device_id,
            data: SharedBytes::zeroed(size),
            device,
            deallocated: AtomicBool::new(false),
        }
    }

    /// Device address of the buffer's first byte
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Memory region the buffer lives in
    #[inline]
    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    /// Id of the owning device
    #[inline]
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Whether the buffer's address range has been returned to the allocator
    #[inline]
    pub fn is_deallocated(&self) -> bool {
        self.deallocated.load(Ordering::Acquire)
    }

    /// Copy buffer contents out
    pub(crate) fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        if self.is_deallocated() {
            return Err(Error::Internal(format!(
                "read from deallocated buffer at {:#x}",
                self.address
            )));
        }
        self.data.read(offset, dst);
        Ok(())
    }

    /// Copy the whole buffer out
    pub(crate) fn read_all(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Copy bytes into the buffer
    pub(crate) fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        if self.is_deallocated() {
            return Err(Error::Internal(format!(
                "write to deallocated buffer at {:#x}",
                self.address
            )));
        }
        self.data.write(offset, src);
        Ok(())
    }

    /// Return the address range to the allocator
    ///
    /// Idempotent; also invoked by Drop. After this, the address may be
    /// reused by new allocations — any trace still referencing the buffer
    /// fails its address check.
    pub(crate) fn release(&self) {
        if self.deallocated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.device.upgrade() {
            shared
                .allocator
                .lock()
                .free(self.buffer_type, self.address, self.size);
            tracing::trace!(
                device = self.device_id,
                addr = self.address,
                size = self.size,
                "buffer released"
            );
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("buffer_type", &self.buffer_type)
            .field("device", &self.device_id)
            .field("deallocated", &self.is_deallocated())
            .finish()
    }
}
