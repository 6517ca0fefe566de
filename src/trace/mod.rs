//! Trace capture and replay
//!
//! A trace is a recorded command sequence bound to one command queue,
//! replayable without host-side re-dispatch. Capture is a strict two-phase
//! protocol: while a capture is active on a queue, commands submitted to it
//! are recorded instead of executed, and the device allocator is frozen so
//! any allocation fails loudly. Replay assumes every referenced buffer still
//! sits at its captured address; that contract is checked explicitly before
//! any command is re-issued.

use crate::device::{Command, Device, ExecMode};
use crate::error::{Error, Result};
use std::sync::atomic::Ordering;

/// Handle to a captured trace on one device
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraceId(pub(crate) u32);

/// Fixed bookkeeping bytes charged per recorded command
const COMMAND_OVERHEAD_BYTES: usize = 64;

/// In-progress capture on one queue
pub(crate) struct CaptureState {
    pub(crate) cq_id: usize,
    pub(crate) commands: Vec<Command>,
    pub(crate) bytes: usize,
}

impl CaptureState {
    /// Record a command, rejecting kinds that cannot replay
    pub(crate) fn record(&mut self, command: Command) -> Result<()> {
        match &command {
            Command::ReadBuffer { .. } => {
                return Err(Error::invalid_argument(
                    "command",
                    "readback cannot be recorded into a trace",
                ))
            }
            Command::Barrier { .. } | Command::Shutdown => {
                return Err(Error::invalid_argument(
                    "command",
                    "host synchronization cannot be recorded into a trace",
                ))
            }
            Command::WriteBuffer { data, .. } => {
                self.bytes += COMMAND_OVERHEAD_BYTES + data.len();
            }
            Command::Execute { binding, .. } => {
                self.bytes += COMMAND_OVERHEAD_BYTES + 16 * (binding.inputs.len() + 1);
            }
            Command::RecordEvent { .. } | Command::WaitEvent { .. } => {
                self.bytes += COMMAND_OVERHEAD_BYTES;
            }
        }
        self.commands.push(command);
        Ok(())
    }
}

/// A finalized, replayable trace
pub(crate) struct Trace {
    pub(crate) cq_id: usize,
    pub(crate) commands: Vec<Command>,
    #[allow(dead_code)]
    pub(crate) bytes: usize,
}

impl Trace {
    /// Every (buffer, captured address) pair the trace touches
    fn referenced_addresses(&self) -> Vec<(u64, bool)> {
        let mut out = Vec::new();
        for command in &self.commands {
            match command {
                Command::WriteBuffer { dst, .. } => {
                    out.push((dst.address(), dst.is_deallocated()));
                }
                Command::Execute { binding, .. } => {
                    for input in &binding.inputs {
                        out.push((input.address(), input.is_deallocated()));
                    }
                    out.push((binding.output.address(), binding.output.is_deallocated()));
                }
                _ => {}
            }
        }
        out
    }
}

/// Begin recording commands issued to `cq_id`
///
/// Freezes the device allocator: every tensor the captured sequence touches
/// must have been allocated before this call (use
/// [`crate::tensor::Tensor::allocate_on_device`] for outputs). Fails if the
/// device was opened without a trace region or a capture is already active.
pub fn begin_trace_capture(device: &Device, cq_id: usize) -> Result<TraceId> {
    device.ensure_open()?;
    if device.shared.config.trace_region_size == 0 {
        return Err(Error::invalid_argument(
            "trace_region_size",
            "device was opened without a trace region",
        ));
    }
    if cq_id >= device.shared.queues.len() {
        return Err(Error::InvalidQueue {
            cq_id,
            num_queues: device.shared.queues.len(),
        });
    }

    let mut capture = device.shared.capture.lock();
    if capture.is_some() {
        return Err(Error::invalid_argument(
            "trace",
            "a capture is already active on this device",
        ));
    }
    device.shared.allocator.lock().freeze();
    *capture = Some(CaptureState {
        cq_id,
        commands: Vec::new(),
        bytes: 0,
    });

    let trace_id = device.shared.trace_counter.fetch_add(1, Ordering::AcqRel);
    tracing::debug!(device = device.id(), cq_id, trace_id, "trace capture begin");
    Ok(TraceId(trace_id))
}

/// Finalize the capture started with [`begin_trace_capture`]
///
/// Unfreezes the allocator and stores the trace, charging its footprint
/// against the device's trace region.
pub fn end_trace_capture(device: &Device, trace_id: TraceId, cq_id: usize) -> Result<()> {
    let state = {
        let mut capture = device.shared.capture.lock();
        device.shared.allocator.lock().unfreeze();
        capture.take().ok_or_else(|| {
            Error::invalid_argument("trace", "no capture is active on this device")
        })?
    };
    if state.cq_id != cq_id {
        return Err(Error::invalid_argument(
            "cq_id",
            format!("capture was begun on queue {}", state.cq_id),
        ));
    }

    let capacity = device.shared.config.trace_region_size;
    if state.bytes > capacity {
        return Err(Error::TraceRegionExhausted {
            needed: state.bytes,
            capacity,
        });
    }

    tracing::debug!(
        device = device.id(),
        trace_id = trace_id.0,
        commands = state.commands.len(),
        bytes = state.bytes,
        "trace capture end"
    );
    device.shared.traces.lock().insert(
        trace_id.0,
        Trace {
            cq_id: state.cq_id,
            commands: state.commands,
            bytes: state.bytes,
        },
    );
    Ok(())
}

/// Replay a captured trace on its queue
///
/// Verifies the address-stability contract first: every buffer the trace
/// references must still be live at its captured address. Violations fail
/// with [`Error::TraceAddressMismatch`] instead of replaying into undefined
/// state.
pub fn execute_trace(device: &Device, trace_id: TraceId, cq_id: usize, blocking: bool) -> Result<()> {
    device.ensure_open()?;
    let commands = {
        let traces = device.shared.traces.lock();
        let trace = traces
            .get(&trace_id.0)
            .ok_or(Error::TraceNotFound { trace_id: trace_id.0 })?;
        if trace.cq_id != cq_id {
            return Err(Error::invalid_argument(
                "cq_id",
                format!("trace was captured on queue {}", trace.cq_id),
            ));
        }

        let allocator = device.shared.allocator.lock();
        for (addr, deallocated) in trace.referenced_addresses() {
            if deallocated || !allocator.is_live(addr) {
                return Err(Error::TraceAddressMismatch { addr });
            }
        }
        trace.commands.clone()
    };

    tracing::debug!(
        device = device.id(),
        trace_id = trace_id.0,
        commands = commands.len(),
        "trace replay"
    );
    for command in commands {
        device.submit(cq_id, command, ExecMode::Async)?;
    }
    if blocking {
        device.synchronize()?;
    }
    Ok(())
}

/// Release a trace, freeing its region footprint
pub fn release_trace(device: &Device, trace_id: TraceId) -> Result<()> {
    device
        .shared
        .traces
        .lock()
        .remove(&trace_id.0)
        .map(|_| ())
        .ok_or(Error::TraceNotFound { trace_id: trace_id.0 })
}
