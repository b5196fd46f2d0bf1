//! Media-buffer ownership tracking
//!
//! Every buffer in a pool is in exactly one of four queues at any instant:
//!
//! * `free`       — owned by the host, idle
//! * `in_flight`  — handed to the remote, its contents are the remote's
//! * `completed`  — returned by the remote, waiting for the IO worker
//! * `processing` — the IO worker is consuming the payload
//!
//! Queue moves are single-mutex splices, the hosted equivalent of the
//! interrupts-off window the protocol needs on bare metal. Violations —
//! a completion for a buffer that is not in flight — mean the two sides
//! have desynchronized, which is not locally repairable.

pub mod work;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mmal::wire::{BufferFlags, BufferTransfer};

/// Ownership states, one per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Free,
    InFlight,
    Completed,
    Processing,
}

/// Payload region plus the metadata the remote reports with it.
pub struct BufferData {
    pub bytes: Vec<u8>,
    pub length: usize,
    pub flags: BufferFlags,
    pub pts: i64,
    pub dts: i64,
}

/// One media buffer. The backing memory is visible to the remote through
/// its import token, so the bytes may only be touched by whichever side
/// currently owns the buffer — that is the whole point of the pool.
pub struct MediaBuffer {
    index: usize,
    import_handle: u32,
    capacity: usize,
    data: Mutex<BufferData>,
}

impl MediaBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn import_handle(&self) -> u32 {
        self.import_handle
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn data(&self) -> MutexGuard<'_, BufferData> {
        self.data.lock().unwrap()
    }

    /// Copy out the valid payload with its metadata.
    pub fn snapshot(&self) -> (Bytes, BufferFlags, i64) {
        let data = self.data();
        let length = data.length.min(data.bytes.len());
        (
            Bytes::copy_from_slice(&data.bytes[..length]),
            data.flags,
            data.pts,
        )
    }
}

/// Registry mapping zero-copy import tokens to backing memory. Both the
/// pool and the remote endpoint hold it: the token is how a buffer is named
/// across the boundary without moving its bytes.
#[derive(Default)]
pub struct ImportTable {
    entries: Mutex<HashMap<u32, Arc<MediaBuffer>>>,
    next: AtomicU32,
}

impl ImportTable {
    pub fn new() -> Arc<Self> {
        Arc::new(ImportTable::default())
    }

    fn next_token(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, token: u32, buffer: Arc<MediaBuffer>) {
        self.entries.lock().unwrap().insert(token, buffer);
    }

    pub fn lookup(&self, token: u32) -> Option<Arc<MediaBuffer>> {
        self.entries.lock().unwrap().get(&token).cloned()
    }
}

struct OwnershipQueues {
    free: VecDeque<usize>,
    in_flight: VecDeque<usize>,
    completed: VecDeque<usize>,
    processing: VecDeque<usize>,
}

#[derive(Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    recycled: AtomicU64,
}

/// Fixed pool of media buffers plus their ownership queues.
pub struct BufferPool {
    buffers: Vec<Arc<MediaBuffer>>,
    queues: Mutex<OwnershipQueues>,
    stats: CachePadded<PoolStats>,
}

impl BufferPool {
    /// Allocate `count` buffers of `capacity` bytes each and register their
    /// backing memory with the import table.
    pub fn new(count: usize, capacity: usize, imports: &ImportTable) -> Arc<Self> {
        let buffers: Vec<Arc<MediaBuffer>> = (0..count)
            .map(|index| {
                let token = imports.next_token();
                let buffer = Arc::new(MediaBuffer {
                    index,
                    import_handle: token,
                    capacity,
                    data: Mutex::new(BufferData {
                        bytes: vec![0; capacity],
                        length: 0,
                        flags: BufferFlags::default(),
                        pts: 0,
                        dts: 0,
                    }),
                });
                imports.insert(token, Arc::clone(&buffer));
                buffer
            })
            .collect();
        debug!(count, capacity, "buffer pool allocated");
        Arc::new(BufferPool {
            buffers,
            queues: Mutex::new(OwnershipQueues {
                free: (0..count).collect(),
                in_flight: VecDeque::new(),
                completed: VecDeque::new(),
                processing: VecDeque::new(),
            }),
            stats: CachePadded::new(PoolStats::default()),
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer(&self, index: usize) -> &Arc<MediaBuffer> {
        &self.buffers[index]
    }

    /// Client-context token embedded in submissions for `index`.
    pub fn context_for(&self, index: usize) -> u32 {
        index as u32 + 1
    }

    /// Inverse of [`context_for`]: which buffer a returned token names.
    pub fn by_context(&self, client_context: u32) -> Option<usize> {
        let index = (client_context as usize).checked_sub(1)?;
        (index < self.buffers.len()).then_some(index)
    }

    /// Take a free buffer for submission: `free → in_flight`.
    pub fn claim_free(&self) -> Option<usize> {
        let mut q = self.queues.lock().unwrap();
        let index = q.free.pop_front()?;
        q.in_flight.push_back(index);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Some(index)
    }

    /// Undo a claim whose submission never reached the ring:
    /// `in_flight → free`.
    pub fn abort_submit(&self, index: usize) {
        let mut q = self.queues.lock().unwrap();
        if remove(&mut q.in_flight, index) {
            q.free.push_back(index);
        }
    }

    /// The remote returned this buffer: `in_flight → completed`, recording
    /// the metadata it reported. A buffer that is not in flight means the
    /// two sides disagree about ownership.
    pub fn complete(&self, index: usize, transfer: &BufferTransfer) -> Result<()> {
        let mut q = self.queues.lock().unwrap();
        if !remove(&mut q.in_flight, index) {
            return Err(Error::Corrupted("buffer returned while not in flight"));
        }
        q.completed.push_back(index);
        drop(q);
        let mut data = self.buffers[index].data();
        data.length = transfer.length as usize;
        data.flags = transfer.flags;
        data.pts = transfer.pts;
        data.dts = transfer.dts;
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Shortcut path: the buffer goes straight back to the remote without
    /// ever leaving `in_flight`. Moves it to the back so queue order keeps
    /// matching submission order.
    pub fn requeue_remote(&self, index: usize) -> Result<()> {
        let mut q = self.queues.lock().unwrap();
        if !remove(&mut q.in_flight, index) {
            return Err(Error::Corrupted("buffer returned while not in flight"));
        }
        q.in_flight.push_back(index);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Worker picks the buffer up: `completed → processing`.
    pub fn begin_processing(&self, index: usize) -> Result<()> {
        let mut q = self.queues.lock().unwrap();
        if !remove(&mut q.completed, index) {
            return Err(Error::Corrupted("processing a buffer that is not completed"));
        }
        q.processing.push_back(index);
        Ok(())
    }

    /// Payload consumed, buffer idle again: `processing → free`.
    pub fn finish(&self, index: usize) -> Result<()> {
        let mut q = self.queues.lock().unwrap();
        if !remove(&mut q.processing, index) {
            return Err(Error::Corrupted("finishing a buffer that is not processing"));
        }
        q.free.push_back(index);
        self.stats.recycled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Payload consumed and the buffer goes straight back out:
    /// `processing → in_flight`.
    pub fn resubmit(&self, index: usize) -> Result<()> {
        let mut q = self.queues.lock().unwrap();
        if !remove(&mut q.processing, index) {
            return Err(Error::Corrupted("resubmitting a buffer that is not processing"));
        }
        q.in_flight.push_back(index);
        self.stats.recycled.fetch_add(1, Ordering::Relaxed);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current queue lengths as `[free, in_flight, completed, processing]`.
    /// Their sum equals the pool size at every instant.
    pub fn census(&self) -> [usize; 4] {
        let q = self.queues.lock().unwrap();
        [
            q.free.len(),
            q.in_flight.len(),
            q.completed.len(),
            q.processing.len(),
        ]
    }

    /// Which queue holds `index` right now, if the index is valid.
    pub fn ownership(&self, index: usize) -> Option<Ownership> {
        let q = self.queues.lock().unwrap();
        if q.free.contains(&index) {
            Some(Ownership::Free)
        } else if q.in_flight.contains(&index) {
            Some(Ownership::InFlight)
        } else if q.completed.contains(&index) {
            Some(Ownership::Completed)
        } else if q.processing.contains(&index) {
            Some(Ownership::Processing)
        } else {
            None
        }
    }

    /// (submitted, completed, recycled) counters.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.submitted.load(Ordering::Relaxed),
            self.stats.completed.load(Ordering::Relaxed),
            self.stats.recycled.load(Ordering::Relaxed),
        )
    }

    /// Build a submission record for `index` on the given remote port.
    pub fn transfer_for(&self, index: usize, component: u32, port_handle: u32) -> BufferTransfer {
        let buffer = &self.buffers[index];
        BufferTransfer {
            component,
            port_handle,
            client_context: self.context_for(index),
            import_handle: buffer.import_handle(),
            alloc_size: buffer.capacity() as u32,
            ..Default::default()
        }
    }
}

fn remove(queue: &mut VecDeque<usize>, index: usize) -> bool {
    match queue.iter().position(|&i| i == index) {
        Some(pos) => {
            queue.remove(pos);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(count: usize) -> Arc<BufferPool> {
        BufferPool::new(count, 1024, &ImportTable::new())
    }

    fn transfer() -> BufferTransfer {
        BufferTransfer {
            length: 100,
            flags: BufferFlags::FRAME_END,
            pts: 42,
            ..Default::default()
        }
    }

    #[test]
    fn full_cycle_conserves_membership() {
        let pool = pool(4);
        assert_eq!(pool.census(), [4, 0, 0, 0]);

        let idx = pool.claim_free().unwrap();
        assert_eq!(pool.census(), [3, 1, 0, 0]);
        assert_eq!(pool.ownership(idx), Some(Ownership::InFlight));

        pool.complete(idx, &transfer()).unwrap();
        assert_eq!(pool.census(), [3, 0, 1, 0]);

        pool.begin_processing(idx).unwrap();
        assert_eq!(pool.census(), [3, 0, 0, 1]);

        pool.finish(idx).unwrap();
        assert_eq!(pool.census(), [4, 0, 0, 0]);
    }

    #[test]
    fn completion_metadata_lands_on_the_buffer() {
        let pool = pool(2);
        let idx = pool.claim_free().unwrap();
        pool.complete(idx, &transfer()).unwrap();
        let (payload, flags, pts) = pool.buffer(idx).snapshot();
        assert_eq!(payload.len(), 100);
        assert!(flags.contains(BufferFlags::FRAME_END));
        assert_eq!(pts, 42);
    }

    #[test]
    fn unexpected_completion_is_fatal() {
        let pool = pool(2);
        assert!(matches!(
            pool.complete(0, &transfer()),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn resubmit_skips_the_free_queue() {
        let pool = pool(2);
        let idx = pool.claim_free().unwrap();
        pool.complete(idx, &transfer()).unwrap();
        pool.begin_processing(idx).unwrap();
        pool.resubmit(idx).unwrap();
        assert_eq!(pool.ownership(idx), Some(Ownership::InFlight));
        assert_eq!(pool.census(), [1, 1, 0, 0]);
    }

    #[test]
    fn context_tokens_round_trip() {
        let pool = pool(3);
        for idx in 0..3 {
            assert_eq!(pool.by_context(pool.context_for(idx)), Some(idx));
        }
        assert_eq!(pool.by_context(0), None);
        assert_eq!(pool.by_context(99), None);
    }

    #[test]
    fn import_tokens_resolve_backing_memory() {
        let imports = ImportTable::new();
        let pool = BufferPool::new(2, 512, &imports);
        let token = pool.buffer(1).import_handle();
        let via_table = imports.lookup(token).unwrap();
        assert_eq!(via_table.index(), 1);
        assert!(imports.lookup(9999).is_none());
    }
}
