//! Coverage sink: where breakpoint-driven block coverage goes.
//!
//! The engine only ever calls `record(pid, module_id, addr)`; everything
//! about persistence is the sink's business. The file writer below emits a
//! small self-describing stream: a header mapping module ids to names,
//! then one packed record per hit, in execution order.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::warn;

pub trait CoverageSink {
    fn record(&mut self, pid: u32, module_id: u16, addr: u64);
}

/// In-memory sink, mainly for tests and short runs.
#[derive(Default)]
pub struct MemorySink {
    pub records: Vec<(u32, u16, u64)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Default::default()
    }
}

impl CoverageSink for MemorySink {
    fn record(&mut self, pid: u32, module_id: u16, addr: u64) {
        self.records.push((pid, module_id, addr));
    }
}

const MAGIC: &[u8; 8] = b"TKCOV01\0";

/// File-backed sink. Layout, all little-endian:
///
/// ```text
/// magic[8]  module_count:u16  { id:u16  name_len:u16  name[..] }*
/// { pid:u32  module_id:u16  addr:u64 }*
/// ```
pub struct CoverageFileWriter {
    out: BufWriter<File>,
}

impl CoverageFileWriter {
    pub fn create<P: AsRef<Path>>(path: P, modules: &[(u16, &str)]) -> std::io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(MAGIC)?;
        out.write_all(&(modules.len() as u16).to_le_bytes())?;
        for (id, name) in modules {
            out.write_all(&id.to_le_bytes())?;
            out.write_all(&(name.len() as u16).to_le_bytes())?;
            out.write_all(name.as_bytes())?;
        }
        Ok(CoverageFileWriter { out })
    }
}

impl CoverageSink for CoverageFileWriter {
    fn record(&mut self, pid: u32, module_id: u16, addr: u64) {
        let mut buf = [0u8; 14];
        buf[0..4].copy_from_slice(&pid.to_le_bytes());
        buf[4..6].copy_from_slice(&module_id.to_le_bytes());
        buf[6..14].copy_from_slice(&addr.to_le_bytes());
        if let Err(err) = self.out.write_all(&buf) {
            warn!("coverage record dropped: {}", err);
        }
    }
}

impl Drop for CoverageFileWriter {
    fn drop(&mut self) {
        if let Err(err) = self.out.flush() {
            warn!("coverage stream flush failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_execution_order() {
        let mut sink = MemorySink::new();
        sink.record(10, 1, 0x100);
        sink.record(10, 1, 0x300);
        sink.record(11, 2, 0x100);
        assert_eq!(
            sink.records,
            vec![(10, 1, 0x100), (10, 1, 0x300), (11, 2, 0x100)]
        );
    }

    #[test]
    fn file_layout_round_trips() {
        let path = std::env::temp_dir().join(format!("tkcov-test-{}", std::process::id()));
        {
            let mut writer =
                CoverageFileWriter::create(&path, &[(1, "target"), (2, "libc.so.6")]).unwrap();
            writer.record(99, 1, 0xdead_beef);
        }
        let bytes = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(u16::from_le_bytes([bytes[8], bytes[9]]), 2);
        // First module entry: id 1, name "target".
        assert_eq!(u16::from_le_bytes([bytes[10], bytes[11]]), 1);
        assert_eq!(u16::from_le_bytes([bytes[12], bytes[13]]), 6);
        assert_eq!(&bytes[14..20], b"target");
        // Record lives after the second module entry (id+len+9 bytes).
        let rec = &bytes[20 + 2 + 2 + 9..];
        assert_eq!(u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]), 99);
        assert_eq!(u16::from_le_bytes([rec[4], rec[5]]), 1);
        assert_eq!(
            u64::from_le_bytes([rec[6], rec[7], rec[8], rec[9], rec[10], rec[11], rec[12], rec[13]]),
            0xdead_beef
        );
    }
}
