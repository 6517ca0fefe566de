//! FIFO command queues
//!
//! Each hardware command queue is a worker thread draining an in-order
//! channel. Queues on one device progress independently; ordering between
//! them exists only through event record/wait pairs. Whether an enqueue
//! blocks the host is a per-call [`ExecMode`], not a device-wide toggle.

use super::event::Event;
use super::DeviceBuffer;
use crate::error::{Error, Result};
use crate::ops::{CompiledProgram, ProgramBinding};
use crate::profiler::{OpRecord, Profiler};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Host-side behavior of an enqueue call
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Return as soon as the command is queued
    #[default]
    Async,
    /// Block until the device has executed the command
    Blocking,
}

/// One queued device command
#[derive(Clone)]
pub(crate) enum Command {
    /// Copy host bytes into a device buffer
    WriteBuffer {
        dst: Arc<DeviceBuffer>,
        data: Arc<Vec<u8>>,
    },
    /// Copy a device buffer back to the host
    ReadBuffer {
        src: Arc<DeviceBuffer>,
        reply: mpsc::Sender<Vec<u8>>,
    },
    /// Execute a compiled program with bound buffers
    Execute {
        program: Arc<CompiledProgram>,
        binding: ProgramBinding,
    },
    /// Signal an event ticket
    RecordEvent { event: Event, ticket: u64 },
    /// Stall the queue until an event ticket completes
    WaitEvent { event: Event, ticket: u64 },
    /// Host rendezvous: signal when everything before it has executed
    Barrier { done: mpsc::Sender<()> },
    /// Stop the worker
    Shutdown,
}

/// One hardware command queue with its worker thread
pub(crate) struct CommandQueue {
    device_id: usize,
    sender: Mutex<mpsc::Sender<Command>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    pub(crate) fn spawn(id: usize, device_id: usize, profiler: Arc<Profiler>) -> Self {
        let (sender, receiver) = mpsc::channel::<Command>();
        let worker = std::thread::Builder::new()
            .name(format!("tilr-dev{device_id}-cq{id}"))
            .spawn(move || worker_loop(receiver, device_id, profiler))
            .expect("failed to spawn command queue worker");
        Self {
            device_id,
            sender: Mutex::new(sender),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Push a command into the queue
    pub(crate) fn enqueue(&self, command: Command) -> Result<()> {
        self.sender
            .lock()
            .send(command)
            .map_err(|_| Error::DeviceClosed {
                device_id: self.device_id,
            })
    }

    /// Drain the queue: returns once every prior command has executed
    pub(crate) fn finish(&self) -> Result<()> {
        let (done, wait) = mpsc::channel();
        self.enqueue(Command::Barrier { done })?;
        wait.recv().map_err(|_| Error::DeviceClosed {
            device_id: self.device_id,
        })
    }

    /// Drain with a watchdog deadline
    pub(crate) fn finish_timeout(&self, timeout: Duration) -> Result<()> {
        let (done, wait) = mpsc::channel();
        self.enqueue(Command::Barrier { done })?;
        wait.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => Error::Timeout {
                device_id: self.device_id,
                waited_ms: timeout.as_millis() as u64,
            },
            mpsc::RecvTimeoutError::Disconnected => Error::DeviceClosed {
                device_id: self.device_id,
            },
        })
    }

    /// Stop and join the worker; used by device close
    pub(crate) fn shutdown(&self) {
        let _ = self.enqueue(Command::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: mpsc::Receiver<Command>, device_id: usize, profiler: Arc<Profiler>) {
    tracing::debug!(device = device_id, "command queue worker started");
    while let Ok(command) = receiver.recv() {
        match command {
            Command::WriteBuffer { dst, data } => {
                if let Err(err) = dst.write(0, &data) {
                    tracing::error!(device = device_id, %err, "write command failed");
                }
            }
            Command::ReadBuffer { src, reply } => match src.read_all() {
                Ok(bytes) => {
                    let _ = reply.send(bytes);
                }
                Err(err) => {
                    tracing::error!(device = device_id, %err, "read command failed");
                }
            },
            Command::Execute { program, binding } => {
                let start = Instant::now();
                if let Err(err) = program.execute(&binding) {
                    tracing::error!(
                        device = device_id,
                        op = program.op_name(),
                        %err,
                        "program execution failed"
                    );
                    continue;
                }
                profiler.record(OpRecord {
                    op_name: program.op_name(),
                    device_id,
                    core_count: program.core_count(),
                    kernel_duration_ns: start.elapsed().as_nanos() as u64,
                });
            }
            Command::RecordEvent { event, ticket } => event.complete(ticket),
            Command::WaitEvent { event, ticket } => event.wait_completed(ticket),
            Command::Barrier { done } => {
                let _ = done.send(());
            }
            Command::Shutdown => break,
        }
    }
    tracing::debug!(device = device_id, "command queue worker stopped");
}
