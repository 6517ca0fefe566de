//! Device abstraction: open/close lifecycle, command queues, and per-device
//! context
//!
//! A [`Device`] is a cheaply-clonable handle to one accelerator. All mutable
//! per-device state — the memory allocator, the program cache, capture state,
//! stored traces, the profiler — lives in an explicit context owned by the
//! device, never in module-level globals, so multiple devices (and mock
//! configurations in tests) coexist without cross-contamination.

mod allocator;
mod arch;
mod buffer;
mod event;
mod queue;

pub use arch::Arch;
pub use buffer::DeviceBuffer;
pub use event::Event;
pub use queue::ExecMode;

pub(crate) use allocator::DeviceAllocator;
pub(crate) use queue::{Command, CommandQueue};

use crate::error::{Error, Result};
use crate::memory::{BufferType, CoreCoord};
use crate::ops::ProgramCache;
use crate::profiler::Profiler;
use crate::trace::{CaptureState, Trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default reserved small-L1 region size in bytes
pub const DEFAULT_L1_SMALL_SIZE: usize = 32768;

/// Options for [`Device::open`]
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Architecture of the simulated part
    pub arch: Arch,
    /// Reserved small-L1 region size in bytes
    pub l1_small_size: usize,
    /// Number of hardware command queues (1 or 2)
    pub num_hw_cqs: usize,
    /// Trace command storage size in bytes (0 disables tracing)
    pub trace_region_size: usize,
    /// Override the DRAM pool capacity (None uses the arch default)
    pub dram_size: Option<usize>,
    /// Override the L1 pool capacity (None uses the arch default)
    pub l1_size: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Wormhole,
            l1_small_size: DEFAULT_L1_SMALL_SIZE,
            num_hw_cqs: 1,
            trace_region_size: 0,
            dram_size: None,
            l1_size: None,
        }
    }
}

pub(crate) struct DeviceShared {
    pub(crate) id: usize,
    pub(crate) arch: Arch,
    pub(crate) config: DeviceConfig,
    pub(crate) allocator: Mutex<DeviceAllocator>,
    pub(crate) queues: Vec<CommandQueue>,
    pub(crate) program_cache: ProgramCache,
    pub(crate) capture: Mutex<Option<CaptureState>>,
    pub(crate) traces: Mutex<HashMap<u32, Trace>>,
    pub(crate) trace_counter: AtomicU32,
    pub(crate) profiler: Arc<Profiler>,
    pub(crate) closed: AtomicBool,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.shutdown();
        }
    }
}

/// Handle to one open accelerator device
#[derive(Clone)]
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
}

impl Device {
    /// Open a device with the given configuration
    pub fn open(device_id: usize, config: DeviceConfig) -> Result<Device> {
        if !(1..=2).contains(&config.num_hw_cqs) {
            return Err(Error::invalid_argument(
                "num_hw_cqs",
                format!("{} is not in 1..=2", config.num_hw_cqs),
            ));
        }
        let arch = config.arch;
        let dram_size = config.dram_size.unwrap_or(arch.dram_size());
        let l1_size = config
            .l1_size
            .unwrap_or(arch.num_cores() * arch.l1_size_per_core());

        let profiler = Arc::new(Profiler::new());
        let queues = (0..config.num_hw_cqs)
            .map(|cq| CommandQueue::spawn(cq, device_id, Arc::clone(&profiler)))
            .collect();

        tracing::debug!(
            device = device_id,
            ?arch,
            num_hw_cqs = config.num_hw_cqs,
            trace_region = config.trace_region_size,
            "device open"
        );

        Ok(Device {
            shared: Arc::new(DeviceShared {
                id: device_id,
                arch,
                allocator: Mutex::new(DeviceAllocator::new(
                    dram_size,
                    l1_size,
                    config.l1_small_size,
                    config.trace_region_size,
                )),
                queues,
                program_cache: ProgramCache::new(),
                capture: Mutex::new(None),
                traces: Mutex::new(HashMap::new()),
                trace_counter: AtomicU32::new(0),
                profiler,
                closed: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Device id
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Architecture of the device
    pub fn arch(&self) -> Arch {
        self.shared.arch
    }

    /// Compute-with-storage grid size
    pub fn core_grid(&self) -> CoreCoord {
        self.shared.arch.grid_size()
    }

    /// Number of hardware command queues
    pub fn num_queues(&self) -> usize {
        self.shared.queues.len()
    }

    /// The device's program cache
    pub fn program_cache(&self) -> &ProgramCache {
        &self.shared.program_cache
    }

    /// The device's profiler buffer
    pub fn profiler(&self) -> &Profiler {
        &self.shared.profiler
    }

    /// Flush device instrumentation to a CSV file
    ///
    /// Synchronizes first so every executed program is included.
    pub fn dump_profiler(&self, path: &std::path::Path) -> Result<()> {
        self.synchronize()?;
        self.shared
            .profiler
            .dump(path)
            .map_err(|e| Error::Internal(format!("profiler dump failed: {e}")))
    }

    /// Block until all outstanding work on all queues completes
    pub fn synchronize(&self) -> Result<()> {
        self.ensure_open()?;
        for queue in &self.shared.queues {
            queue.finish()?;
        }
        Ok(())
    }

    /// Synchronize with a host-side watchdog deadline
    ///
    /// A timeout means a command hung; the device cannot cancel it, so the
    /// only recovery is dropping the device (a reset), not a retry.
    pub fn synchronize_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        for queue in &self.shared.queues {
            queue.finish_timeout(timeout)?;
        }
        Ok(())
    }

    /// Close the device: synchronize, stop the queues, and reject further
    /// work
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for queue in &self.shared.queues {
            queue.finish()?;
            queue.shutdown();
        }
        tracing::debug!(device = self.shared.id, "device closed");
        Ok(())
    }

    /// Record an event on a queue
    ///
    /// The event signals when the queue's worker reaches this point in the
    /// stream.
    pub fn record_event(&self, cq_id: usize, event: &Event) -> Result<()> {
        if cq_id >= self.shared.queues.len() {
            return Err(Error::InvalidQueue {
                cq_id,
                num_queues: self.shared.queues.len(),
            });
        }
        let ticket = event.next_ticket();
        self.submit(
            cq_id,
            Command::RecordEvent {
                event: event.clone(),
                ticket,
            },
            ExecMode::Async,
        )
    }

    /// Make a queue wait for the most recently recorded ticket of an event
    ///
    /// Commands enqueued after the wait do not execute until the recording
    /// queue reaches its record point. This is the only cross-queue ordering
    /// edge.
    pub fn wait_for_event(&self, cq_id: usize, event: &Event) -> Result<()> {
        let ticket = event.current_ticket();
        self.submit(
            cq_id,
            Command::WaitEvent {
                event: event.clone(),
                ticket,
            },
            ExecMode::Async,
        )
    }

    /// Bytes currently allocated in DRAM
    pub fn dram_allocated(&self) -> usize {
        self.shared.allocator.lock().allocated_bytes(BufferType::Dram)
    }

    /// Bytes currently allocated in L1
    pub fn l1_allocated(&self) -> usize {
        self.shared.allocator.lock().allocated_bytes(BufferType::L1)
    }

    /// Human-readable memory state summary
    pub fn dump_memory_state(&self) -> String {
        let allocator = self.shared.allocator.lock();
        let mut out = String::new();
        for bt in [
            BufferType::Dram,
            BufferType::L1,
            BufferType::L1Small,
            BufferType::Trace,
        ] {
            out.push_str(&format!(
                "{:?}: allocated {} bytes (peak {})\n",
                bt,
                allocator.allocated_bytes(bt),
                allocator.peak_bytes(bt),
            ));
        }
        out
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::DeviceClosed {
                device_id: self.shared.id,
            });
        }
        Ok(())
    }

    /// Allocate a device buffer
    ///
    /// Fails while a trace capture has the allocator frozen.
    pub(crate) fn allocate_buffer(
        &self,
        size: usize,
        buffer_type: BufferType,
    ) -> Result<Arc<DeviceBuffer>> {
        self.ensure_open()?;
        let addr = self.shared.allocator.lock().alloc(buffer_type, size)?;
        tracing::trace!(
            device = self.shared.id,
            addr,
            size,
            ?buffer_type,
            "buffer allocated"
        );
        Ok(Arc::new(DeviceBuffer::new(
            addr,
            size,
            buffer_type,
            self.shared.id,
            Arc::downgrade(&self.shared),
        )))
    }

    /// Route a command to a queue, or into an active capture on that queue
    pub(crate) fn submit(&self, cq_id: usize, command: Command, mode: ExecMode) -> Result<()> {
        self.ensure_open()?;
        let queue = self
            .shared
            .queues
            .get(cq_id)
            .ok_or(Error::InvalidQueue {
                cq_id,
                num_queues: self.shared.queues.len(),
            })?;

        {
            let mut capture = self.shared.capture.lock();
            if let Some(state) = capture.as_mut() {
                if state.cq_id == cq_id {
                    state.record(command)?;
                    return Ok(());
                }
            }
        }

        queue.enqueue(command)?;
        if mode == ExecMode::Blocking {
            queue.finish()?;
        }
        Ok(())
    }

    /// Read a buffer's contents through a queue
    pub(crate) fn read_buffer(
        &self,
        cq_id: usize,
        buffer: &Arc<DeviceBuffer>,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let (reply, receive) = std::sync::mpsc::channel();
        self.submit(
            cq_id,
            Command::ReadBuffer {
                src: Arc::clone(buffer),
                reply,
            },
            ExecMode::Async,
        )?;
        receive.recv().map_err(|_| Error::DeviceClosed {
            device_id: self.shared.id,
        })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("arch", &self.shared.arch)
            .field("num_queues", &self.shared.queues.len())
            .finish()
    }
}
