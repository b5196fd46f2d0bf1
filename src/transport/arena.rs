//! Memory-mapped slot arena shared with the remote endpoint
//!
//! The arena models the physically shared region both processors see: a
//! header slot followed by two equal halves of data slots, one half per
//! transmit direction. Each direction has exactly one writer (the owning
//! side) and one reader (the peer); the writer publishes progress through a
//! monotonic byte position and the reader hands consumed slots back through
//! a free-slot queue. All cross-side signaling that would be doorbell
//! interrupts on hardware is collapsed to edge-triggered channel events.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use memmap2::MmapMut;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::wire::{
    self, MsgId, MsgKind, FourCc, HEADER_BYTES, MAX_PAYLOAD, SLOT_SIZE,
};

/// Magic written into the header slot at init, checked by the peer.
pub const ARENA_MAGIC: FourCc = FourCc::new(b"VCHI");
/// Ring protocol version advertised in the header slot.
pub const ARENA_VERSION: u16 = 8;
/// Oldest ring protocol version this implementation still speaks.
pub const ARENA_VERSION_MIN: u16 = 3;

/// Fewest data slots per direction for a viable ring.
const MIN_SLOTS_PER_SIDE: usize = 4;

/// Which endpoint of the arena is acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Remote,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Host => Side::Remote,
            Side::Remote => Side::Host,
        }
    }
}

/// Edge-triggered wakeup shared between the two endpoints.
///
/// Capacity-one channel: repeated notifications coalesce, which is the same
/// contract a level-held doorbell line gives the receiving side.
pub(crate) struct Event {
    tx: flume::Sender<()>,
    rx: flume::Receiver<()>,
}

impl Event {
    fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Event { tx, rx }
    }

    pub(crate) fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

/// Per-direction shared state: one instance for each side's transmissions.
struct DirectionState {
    /// Monotonic byte count published by this side's writer. Storing it is
    /// the commit point of a message; readers never see a partial write.
    tx_pos: AtomicU32,
    /// Free-slot ring for this side's writer. The peer's reader appends
    /// consumed slots at `recycle_pos`; the local reclaim pass validates
    /// them and advances `slots_ready`, which is what the writer trusts.
    slot_queue: Box<[AtomicU32]>,
    recycle_pos: AtomicU32,
    slots_ready: AtomicU32,
    /// Serializes senders on the owning side; the peer never touches it.
    send_lock: Mutex<()>,
    /// Woken when the peer publishes messages toward this side.
    trigger: Event,
    /// Woken when the peer returns consumed slots to this side's writer.
    recycle: Event,
    /// Woken by the local reclaim pass when validated slots become usable.
    slot_ready: Event,
}

impl DirectionState {
    fn new(first_slot: usize, per_side: usize) -> Self {
        let slot_queue: Box<[AtomicU32]> = (0..per_side)
            .map(|i| AtomicU32::new((first_slot + i) as u32))
            .collect();
        DirectionState {
            tx_pos: AtomicU32::new(0),
            slot_queue,
            recycle_pos: AtomicU32::new(per_side as u32),
            slots_ready: AtomicU32::new(per_side as u32),
            send_lock: Mutex::new(()),
            trigger: Event::new(),
            recycle: Event::new(),
            slot_ready: Event::new(),
        }
    }
}

/// Counters for one endpoint's traffic, padded to avoid false sharing.
#[derive(Default)]
struct ArenaStats {
    messages_sent: AtomicU32,
    padding_sent: AtomicU32,
    slots_reclaimed: AtomicU32,
}

/// The shared slot region plus both directions' bookkeeping.
pub struct SlotArena {
    // The mapping owns the region; `base` is its stable address. Slot
    // contents are only touched through the positional protocol: a writer
    // has exclusive use of a claimed slot until the commit store, a reader
    // only walks committed bytes.
    _map: MmapMut,
    base: *mut u8,
    per_side: usize,
    host: DirectionState,
    remote: DirectionState,
    stats: [CachePadded<ArenaStats>; 2],
}

unsafe impl Send for SlotArena {}
unsafe impl Sync for SlotArena {}

impl SlotArena {
    /// Map an anonymous region of `region_bytes` and lay it out as a header
    /// slot plus two halves of data slots. Fails unless each direction gets
    /// at least four data slots.
    pub fn with_capacity(region_bytes: usize) -> Result<Arc<Self>> {
        let total_slots = region_bytes / SLOT_SIZE;
        let per_side = total_slots.saturating_sub(1) / 2;
        if per_side < MIN_SLOTS_PER_SIDE {
            return Err(Error::Exhausted("ring slots"));
        }

        let mut map = MmapMut::map_anon((1 + 2 * per_side) * SLOT_SIZE)
            .map_err(|_| Error::Exhausted("shared region pages"))?;
        let base = map.as_mut_ptr();

        // Header slot: magic, versions, geometry. The peer sanity-checks
        // these before touching any data slot.
        let header = &mut map[..24];
        header[0..4].copy_from_slice(&ARENA_MAGIC.0.to_le_bytes());
        header[4..6].copy_from_slice(&ARENA_VERSION.to_le_bytes());
        header[6..8].copy_from_slice(&ARENA_VERSION_MIN.to_le_bytes());
        header[8..12].copy_from_slice(&(SLOT_SIZE as u32).to_le_bytes());
        header[12..16].copy_from_slice(&(per_side as u32).to_le_bytes());

        debug!(per_side, "slot arena mapped");

        Ok(Arc::new(SlotArena {
            _map: map,
            base,
            per_side,
            host: DirectionState::new(1, per_side),
            remote: DirectionState::new(1 + per_side, per_side),
            stats: [
                CachePadded::new(ArenaStats::default()),
                CachePadded::new(ArenaStats::default()),
            ],
        }))
    }

    /// Data slots available to each direction.
    pub fn slots_per_side(&self) -> usize {
        self.per_side
    }

    /// Check the header slot the other endpoint wrote. Used by the remote
    /// simulator the way firmware probes the region it was handed.
    pub fn verify_header(&self) -> Result<()> {
        let header = unsafe { self.slot(0) };
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if FourCc(magic) != ARENA_MAGIC {
            return Err(Error::Corrupted("bad arena magic"));
        }
        let slot_size = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if slot_size as usize != SLOT_SIZE {
            return Err(Error::Corrupted("arena slot size mismatch"));
        }
        Ok(())
    }

    fn state(&self, side: Side) -> &DirectionState {
        match side {
            Side::Host => &self.host,
            Side::Remote => &self.remote,
        }
    }

    fn stats(&self, side: Side) -> &ArenaStats {
        match side {
            Side::Host => &self.stats[0],
            Side::Remote => &self.stats[1],
        }
    }

    unsafe fn slot(&self, idx: usize) -> &[u8] {
        std::slice::from_raw_parts(self.base.add(idx * SLOT_SIZE), SLOT_SIZE)
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, idx: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base.add(idx * SLOT_SIZE), SLOT_SIZE)
    }

    /// Enqueue one message on `side`'s transmit direction.
    ///
    /// Claims slot space (inserting a padding message and advancing to the
    /// next slot when the message does not fit the remainder), writes header
    /// and payload, then release-publishes the new write position and rings
    /// the peer's trigger. Blocks up to `timeout` when every slot of this
    /// direction is still held by the reader.
    pub fn send(&self, side: Side, msg_id: u32, payload: &[u8], timeout: Duration) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                got: payload.len(),
                limit: MAX_PAYLOAD,
            });
        }
        let st = self.state(side);
        let peer = self.state(side.peer());
        let deadline = Instant::now() + timeout;
        let _guard = st
            .send_lock
            .lock()
            .map_err(|_| Error::Corrupted("send lock poisoned"))?;

        let needed = wire::stride_for(payload.len());
        let mut pos = st.tx_pos.load(Ordering::Relaxed);
        let in_slot = pos as usize % SLOT_SIZE;
        let space = SLOT_SIZE - in_slot;

        if in_slot != 0 && space < needed {
            // Fill the remainder so the reader can cross the boundary, then
            // publish: the reader must consume this slot for it to come back.
            let slot_idx = self.claimed_slot(st, pos);
            let slot = unsafe { self.slot_mut(slot_idx) };
            wire::write_header(
                slot,
                in_slot,
                wire::pack_msg_id(MsgKind::Padding, 0, 0),
                (space - HEADER_BYTES) as u32,
            );
            pos += space as u32;
            st.tx_pos.store(pos, Ordering::Release);
            peer.trigger.notify();
            self.stats(side).padding_sent.fetch_add(1, Ordering::Relaxed);
        }

        if pos as usize % SLOT_SIZE == 0 {
            self.wait_for_slot(st, pos / SLOT_SIZE as u32, deadline)?;
        }

        let slot_idx = self.claimed_slot(st, pos);
        let offset = pos as usize % SLOT_SIZE;
        let slot = unsafe { self.slot_mut(slot_idx) };
        wire::write_header(slot, offset, msg_id, payload.len() as u32);
        slot[offset + HEADER_BYTES..offset + HEADER_BYTES + payload.len()]
            .copy_from_slice(payload);

        // Commit point: the position store is what makes the message
        // visible, so the full body must already be in place.
        st.tx_pos.store(pos + needed as u32, Ordering::Release);
        peer.trigger.notify();
        self.stats(side).messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Physical slot backing byte position `pos` of an already-claimed (or
    /// about-to-be-claimed) transmit slot.
    fn claimed_slot(&self, st: &DirectionState, pos: u32) -> usize {
        let claim = pos / SLOT_SIZE as u32;
        st.slot_queue[claim as usize % self.per_side].load(Ordering::Acquire) as usize
    }

    fn wait_for_slot(&self, st: &DirectionState, claim: u32, deadline: Instant) -> Result<()> {
        loop {
            if claim < st.slots_ready.load(Ordering::Acquire) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("free transmit slot"));
            }
            st.slot_ready.wait(deadline - now);
        }
    }

    /// Block until the peer publishes messages toward `side` (or timeout).
    pub fn wait_incoming(&self, side: Side, timeout: Duration) -> bool {
        self.state(side).trigger.wait(timeout)
    }

    /// Block until the peer returns consumed slots to `side`'s writer.
    pub fn wait_returned(&self, side: Side, timeout: Duration) -> bool {
        self.state(side).recycle.wait(timeout)
    }

    /// Walk every committed message addressed to `side`, starting at
    /// `cursor` (a byte position private to the reader). Padding is
    /// skipped; real messages are handed to `f` before their slot can be
    /// recycled. Returns the number of messages dispatched.
    pub fn drain<F>(&self, side: Side, cursor: &mut u32, mut f: F) -> Result<usize>
    where
        F: FnMut(MsgId, Bytes) -> Result<()>,
    {
        let peer = self.state(side.peer());
        let mut count = 0;
        loop {
            let tx = peer.tx_pos.load(Ordering::Acquire);
            if *cursor == tx {
                return Ok(count);
            }
            let claim = *cursor / SLOT_SIZE as u32;
            let slot_idx =
                peer.slot_queue[claim as usize % self.per_side].load(Ordering::Acquire) as usize;
            let slot = unsafe { self.slot(slot_idx) };
            let offset = *cursor as usize % SLOT_SIZE;
            let (msg_id, size) = wire::read_header(slot, offset)?;
            if msg_id.kind()? != MsgKind::Padding {
                let payload = Bytes::copy_from_slice(
                    &slot[offset + HEADER_BYTES..offset + HEADER_BYTES + size],
                );
                f(msg_id, payload)?;
                count += 1;
            }
            *cursor += wire::stride_for(size) as u32;
            if *cursor as usize % SLOT_SIZE == 0 {
                // Fully consumed: hand the slot back to the peer's writer.
                let rp = peer.recycle_pos.load(Ordering::Relaxed);
                peer.slot_queue[rp as usize % self.per_side]
                    .store(slot_idx as u32, Ordering::Relaxed);
                peer.recycle_pos.store(rp.wrapping_add(1), Ordering::Release);
                peer.recycle.notify();
            }
        }
    }

    /// Validate slots the peer has returned to `side`'s writer and make
    /// them claimable. A returned slot whose headers do not tile it exactly
    /// means the shared state is no longer trustworthy.
    pub fn reclaim(&self, side: Side) -> Result<usize> {
        let st = self.state(side);
        let avail = st.recycle_pos.load(Ordering::Acquire);
        let mut ready = st.slots_ready.load(Ordering::Relaxed);
        let mut n = 0;
        while ready != avail {
            let slot_idx = st.slot_queue[ready as usize % self.per_side].load(Ordering::Relaxed);
            self.check_tiling(slot_idx as usize)?;
            ready = ready.wrapping_add(1);
            n += 1;
        }
        if n > 0 {
            st.slots_ready.store(ready, Ordering::Release);
            st.slot_ready.notify();
            self.stats(side)
                .slots_reclaimed
                .fetch_add(n, Ordering::Relaxed);
            metrics::counter!("vclink_slots_reclaimed").increment(n as u64);
        }
        Ok(n as usize)
    }

    fn check_tiling(&self, slot_idx: usize) -> Result<()> {
        let slot = unsafe { self.slot(slot_idx) };
        let mut offset = 0;
        while offset < SLOT_SIZE {
            // read_header fails if a declared size would overrun the slot,
            // so reaching SLOT_SIZE exactly is the only way out.
            let (_, size) = wire::read_header(slot, offset)?;
            offset += wire::stride_for(size);
        }
        Ok(())
    }

    /// Slots currently claimed by `side`'s writer and not yet reclaimed.
    pub fn slots_in_use(&self, side: Side) -> usize {
        let st = self.state(side);
        let claimed = (st.tx_pos.load(Ordering::Relaxed) as usize + SLOT_SIZE - 1) / SLOT_SIZE;
        let returned = st.slots_ready.load(Ordering::Relaxed) as usize - self.per_side;
        claimed - returned
    }

    /// (messages, padding, reclaimed) counters for `side`.
    pub fn traffic(&self, side: Side) -> (u32, u32, u32) {
        let s = self.stats(side);
        (
            s.messages_sent.load(Ordering::Relaxed),
            s.padding_sent.load(Ordering::Relaxed),
            s.slots_reclaimed.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::pack_msg_id;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn data_id() -> u32 {
        pack_msg_id(MsgKind::Data, 1, 2)
    }

    #[test]
    fn rejects_undersized_region() {
        assert!(SlotArena::with_capacity(4 * SLOT_SIZE).is_err());
        assert!(SlotArena::with_capacity(16 * SLOT_SIZE).is_ok());
    }

    #[test]
    fn single_message_round_trip() {
        let arena = SlotArena::with_capacity(16 * SLOT_SIZE).unwrap();
        arena
            .send(Side::Host, data_id(), b"hello ring", TIMEOUT)
            .unwrap();

        let mut cursor = 0;
        let mut seen = Vec::new();
        arena
            .drain(Side::Remote, &mut cursor, |id, payload| {
                seen.push((id.kind().unwrap(), payload));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, MsgKind::Data);
        assert_eq!(&seen[0].1[..], b"hello ring");
    }

    #[test]
    fn padding_preserves_message_count() {
        let arena = SlotArena::with_capacity(16 * SLOT_SIZE).unwrap();
        // 1000-byte payloads do not divide the slot evenly, forcing a
        // padding message at each boundary.
        let payload = vec![0xa5u8; 1000];
        let sends = 20;
        for _ in 0..sends {
            arena.send(Side::Host, data_id(), &payload, TIMEOUT).unwrap();
        }

        let mut cursor = 0;
        let mut received = 0;
        arena
            .drain(Side::Remote, &mut cursor, |_, payload| {
                assert_eq!(payload.len(), 1000);
                received += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(received, sends);
        let (_, padding, _) = arena.traffic(Side::Host);
        assert!(padding > 0);
    }

    #[test]
    fn writer_blocks_until_slots_return() {
        let arena = SlotArena::with_capacity(16 * SLOT_SIZE).unwrap();
        let per_side = arena.slots_per_side();
        let big = vec![0u8; SLOT_SIZE - HEADER_BYTES];

        for _ in 0..per_side {
            arena.send(Side::Host, data_id(), &big, TIMEOUT).unwrap();
        }
        assert_eq!(arena.slots_in_use(Side::Host), per_side);
        // Ring is full; the next send must time out instead of overwriting.
        assert!(matches!(
            arena.send(Side::Host, data_id(), &big, Duration::from_millis(50)),
            Err(Error::Timeout(_))
        ));

        // Consuming on the far side and reclaiming frees the writer again.
        let mut cursor = 0;
        arena.drain(Side::Remote, &mut cursor, |_, _| Ok(())).unwrap();
        arena.reclaim(Side::Host).unwrap();
        assert_eq!(arena.slots_in_use(Side::Host), 0);
        arena.send(Side::Host, data_id(), &big, TIMEOUT).unwrap();
    }

    #[test]
    fn slot_accounting_never_exceeds_capacity() {
        let arena = SlotArena::with_capacity(24 * SLOT_SIZE).unwrap();
        let per_side = arena.slots_per_side();
        let mut cursor = 0;
        for i in 0..200usize {
            let payload = vec![0u8; (i * 97) % 2048 + 1];
            arena.send(Side::Host, data_id(), &payload, TIMEOUT).unwrap();
            assert!(arena.slots_in_use(Side::Host) <= per_side);
            if i % 5 == 0 {
                arena.drain(Side::Remote, &mut cursor, |_, _| Ok(())).unwrap();
                arena.reclaim(Side::Host).unwrap();
            }
        }
    }

    #[test]
    fn directions_are_independent() {
        let arena = SlotArena::with_capacity(16 * SLOT_SIZE).unwrap();
        arena.send(Side::Host, data_id(), b"to remote", TIMEOUT).unwrap();
        arena.send(Side::Remote, data_id(), b"to host", TIMEOUT).unwrap();

        let mut host_cursor = 0;
        let mut got = Vec::new();
        arena
            .drain(Side::Host, &mut host_cursor, |_, p| {
                got.push(p);
                Ok(())
            })
            .unwrap();
        assert_eq!(&got[0][..], b"to host");
    }
}
