//! Device-side op instrumentation
//!
//! Queue workers record one entry per executed program. `dump` writes the
//! CSV consumed by the downstream throughput/utilization report pipeline;
//! the column names are part of that contract.

use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;

/// One executed-program record
#[derive(Clone, Debug)]
pub struct OpRecord {
    /// Operation name
    pub op_name: &'static str,
    /// Device the program ran on
    pub device_id: usize,
    /// Cores the program occupied
    pub core_count: usize,
    /// Wall-clock kernel duration in nanoseconds
    pub kernel_duration_ns: u64,
}

/// Per-device profiler buffer
#[derive(Default)]
pub struct Profiler {
    records: Mutex<Vec<OpRecord>>,
}

impl Profiler {
    /// Create an empty profiler
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record (called from queue workers)
    pub(crate) fn record(&self, record: OpRecord) {
        self.records.lock().push(record);
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the buffered records
    pub fn records(&self) -> Vec<OpRecord> {
        self.records.lock().clone()
    }

    /// Drop all buffered records
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Write buffered records as CSV
    ///
    /// Columns: `op name, device id, core count, device kernel duration [ns]`.
    pub fn dump(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "op name,device id,core count,device kernel duration [ns]")?;
        for r in self.records.lock().iter() {
            writeln!(
                file,
                "{},{},{},{}",
                r.op_name, r.device_id, r.core_count, r.kernel_duration_ns
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let p = Profiler::new();
        assert!(p.is_empty());
        p.record(OpRecord {
            op_name: "add",
            device_id: 0,
            core_count: 56,
            kernel_duration_ns: 1200,
        });
        let records = p.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].core_count, 56);
        p.clear();
        assert!(p.is_empty());
    }
}
