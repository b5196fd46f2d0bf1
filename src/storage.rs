//! Collaborator seams: storage writer, block device, display sink
//!
//! The pipeline never talks to hardware directly. Encoded output goes to a
//! [`StreamWriter`], preview frames to a [`DisplaySink`]; production builds
//! plug the SD-card stream and the panel in here, tests plug memory.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::mmal::wire::BufferFlags;
use crate::pipeline::preview::PreviewFrame;

/// Append-only sink for the encoded stream. Implementations must write in
/// call order and may only reuse a payload's memory once it is queued past
/// recall — the pool recycles the source buffer right after `append`
/// returns.
pub trait StreamWriter: Send {
    fn append(&mut self, payload: Bytes, flags: BufferFlags, pts: i64) -> Result<()>;

    fn bytes_written(&self) -> u64;
}

/// One appended chunk with the metadata it arrived with.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub payload: Bytes,
    pub flags: BufferFlags,
    pub pts: i64,
}

/// In-memory stream writer for tests and the demo.
#[derive(Default)]
pub struct MemoryStreamWriter {
    pub chunks: Vec<StoredChunk>,
    total: u64,
}

impl MemoryStreamWriter {
    pub fn new() -> Self {
        MemoryStreamWriter::default()
    }
}

impl StreamWriter for MemoryStreamWriter {
    fn append(&mut self, payload: Bytes, flags: BufferFlags, pts: i64) -> Result<()> {
        self.total += payload.len() as u64;
        self.chunks.push(StoredChunk {
            payload,
            flags,
            pts,
        });
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.total
    }
}

/// Sector size every block device here uses.
pub const SECTOR_BYTES: usize = 512;

/// Raw sector-addressed storage.
pub trait BlockDevice: Send {
    fn read(&self, start_sector: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, start_sector: u64, buf: &[u8]) -> Result<()>;
    fn sector_count(&self) -> u64;
}

/// RAM-backed block device for tests.
pub struct MemoryBlockDevice {
    data: Vec<u8>,
}

impl MemoryBlockDevice {
    pub fn new(sectors: u64) -> Self {
        MemoryBlockDevice {
            data: vec![0; sectors as usize * SECTOR_BYTES],
        }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read(&self, start_sector: u64, buf: &mut [u8]) -> Result<()> {
        let offset = start_sector as usize * SECTOR_BYTES;
        let end = offset + buf.len();
        if buf.len() % SECTOR_BYTES != 0 || end > self.data.len() {
            return Err(Error::Exhausted("device sectors"));
        }
        buf.copy_from_slice(&self.data[offset..end]);
        Ok(())
    }

    fn write(&mut self, start_sector: u64, buf: &[u8]) -> Result<()> {
        let offset = start_sector as usize * SECTOR_BYTES;
        let end = offset + buf.len();
        if buf.len() % SECTOR_BYTES != 0 || end > self.data.len() {
            return Err(Error::Exhausted("device sectors"));
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_BYTES) as u64
    }
}

/// Streams appended payloads onto a block device as whole sectors, in
/// strict append order. Partial tail bytes stay staged until the next
/// append or an explicit [`SectorStreamWriter::flush`].
pub struct SectorStreamWriter<D: BlockDevice> {
    device: D,
    next_sector: u64,
    staged: Vec<u8>,
    total: u64,
}

impl<D: BlockDevice> SectorStreamWriter<D> {
    pub fn open(device: D, start_sector: u64) -> Self {
        SectorStreamWriter {
            device,
            next_sector: start_sector,
            staged: Vec::with_capacity(SECTOR_BYTES),
            total: 0,
        }
    }

    /// Pad the staged tail to a sector boundary and write it out.
    pub fn flush(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.staged.resize(SECTOR_BYTES, 0);
        self.device.write(self.next_sector, &self.staged)?;
        self.next_sector += 1;
        self.staged.clear();
        Ok(())
    }

    pub fn into_device(mut self) -> Result<D> {
        self.flush()?;
        Ok(self.device)
    }
}

impl<D: BlockDevice> StreamWriter for SectorStreamWriter<D> {
    fn append(&mut self, payload: Bytes, _flags: BufferFlags, _pts: i64) -> Result<()> {
        self.total += payload.len() as u64;
        self.staged.extend_from_slice(&payload);
        let full = self.staged.len() / SECTOR_BYTES;
        if full > 0 {
            let bytes = full * SECTOR_BYTES;
            self.device.write(self.next_sector, &self.staged[..bytes])?;
            self.next_sector += full as u64;
            self.staged.drain(..bytes);
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.total
    }
}

/// Non-blocking preview consumer. `try_draw` must return immediately:
/// `false` means "busy, drop this frame", which the pipeline counts but
/// does not treat as an error.
pub trait DisplaySink: Send + Sync {
    fn try_draw(&self, frame: &PreviewFrame) -> bool;
}

/// Accepts every frame and counts them.
#[derive(Default)]
pub struct CountingDisplay {
    drawn: AtomicU64,
}

impl CountingDisplay {
    pub fn new() -> Self {
        CountingDisplay::default()
    }

    pub fn drawn(&self) -> u64 {
        self.drawn.load(Ordering::Relaxed)
    }
}

impl DisplaySink for CountingDisplay {
    fn try_draw(&self, _frame: &PreviewFrame) -> bool {
        self.drawn.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Permanently busy display; every frame is dropped. Exercises the lossy
/// preview policy in tests.
pub struct BusyDisplay;

impl DisplaySink for BusyDisplay {
    fn try_draw(&self, _frame: &PreviewFrame) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_writer_appends_in_order() {
        let device = MemoryBlockDevice::new(16);
        let mut writer = SectorStreamWriter::open(device, 2);
        writer
            .append(Bytes::from(vec![1u8; 700]), BufferFlags::default(), 0)
            .unwrap();
        writer
            .append(Bytes::from(vec![2u8; 400]), BufferFlags::default(), 0)
            .unwrap();
        assert_eq!(writer.bytes_written(), 1100);

        let device = writer.into_device().unwrap();
        let mut sectors = vec![0u8; 3 * SECTOR_BYTES];
        device.read(2, &mut sectors).unwrap();
        assert!(sectors[..700].iter().all(|&b| b == 1));
        assert!(sectors[700..1100].iter().all(|&b| b == 2));
        assert!(sectors[1100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn memory_writer_keeps_metadata() {
        let mut writer = MemoryStreamWriter::new();
        writer
            .append(Bytes::from_static(b"nal"), BufferFlags::KEYFRAME, 33)
            .unwrap();
        assert_eq!(writer.chunks.len(), 1);
        assert!(writer.chunks[0].flags.contains(BufferFlags::KEYFRAME));
        assert_eq!(writer.chunks[0].pts, 33);
    }

    #[test]
    fn block_device_bounds_are_checked() {
        let mut device = MemoryBlockDevice::new(2);
        assert!(device.write(2, &[0u8; SECTOR_BYTES]).is_err());
        assert!(device.write(0, &[0u8; 100]).is_err());
        assert!(device.write(1, &[7u8; SECTOR_BYTES]).is_ok());
    }
}
