// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single-producer single-consumer message ring over a shared mapping.
//!
//! Layout: `producer: u32` at offset 0, `consumer: u32` at offset 4, padding
//! to one cache line, then [`RING_CAPACITY`] fixed-size slots each holding
//! one framed message. Both counters are free-running; indices are taken
//! modulo the capacity. Empty iff `producer == consumer`, full iff
//! `producer - consumer == capacity` (wrapping arithmetic).
//!
//! Ordering contract:
//! - a release fence separates the slot write from the producer advance, so
//!   the consumer never observes a counter whose slot is not yet visible;
//! - an acquire fence separates the producer load from the slot read;
//! - the consumer advance is a release store issued only after the slot has
//!   been copied out.

use std::sync::atomic::fence;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use zerocopy::FromBytes;

use crate::protocol::idm_header;
use crate::protocol::HEADER_SIZE;
use crate::Errno;
use crate::IdmError;
use crate::Result;

/// Number of slots per ring. Kept small so both rings of a connection fit
/// comfortably in one development-backend segment.
pub const RING_CAPACITY: u32 = 32;

/// Size of one slot; a framed message must fit entirely in one slot.
pub const SLOT_SIZE: usize = 4096;

// producer + consumer counters, padded to a cache line.
const COUNTERS_SIZE: usize = 64;

/// Total bytes of shared memory one ring occupies.
pub const RING_BYTES: usize = COUNTERS_SIZE + RING_CAPACITY as usize * SLOT_SIZE;

/// Memory backing one ring.
///
/// # Safety
///
/// Implementations must return a pointer that is valid for reads and writes
/// of `len()` bytes, at least 4-byte aligned, and stable for the lifetime of
/// the value. The region may be shared with exactly one peer zone.
pub unsafe trait RingMemory: Send {
    fn base(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// One direction of a connection: a message ring over shared memory.
pub struct Ring {
    mem: Box<dyn RingMemory>,
}

// SAFETY: the ring accesses its mapping only through the producer/consumer
// protocol below; the backing memory itself is Send.
unsafe impl Send for Ring {}
// SAFETY: concurrent use is sound only under the single-producer
// single-consumer discipline the transport enforces (one side pushes, the
// other pops); counter accesses are atomic and slot accesses are fenced.
unsafe impl Sync for Ring {}

impl Ring {
    /// Wraps a ring over `mem`, which must span at least [`RING_BYTES`].
    pub fn new(mem: Box<dyn RingMemory>) -> Result<Ring> {
        if mem.len() < RING_BYTES {
            return Err(IdmError::TransportInit(Errno::new(libc::EINVAL)));
        }
        Ok(Ring { mem })
    }

    fn producer(&self) -> &AtomicU32 {
        // SAFETY: RingMemory guarantees alignment and validity for the whole
        // region; offset 0 is the producer counter.
        unsafe { &*(self.mem.base() as *const AtomicU32) }
    }

    fn consumer(&self) -> &AtomicU32 {
        // SAFETY: as above; offset 4 is the consumer counter.
        unsafe { &*(self.mem.base().add(4) as *const AtomicU32) }
    }

    fn slot_ptr(&self, counter: u32) -> *mut u8 {
        let index = (counter % RING_CAPACITY) as usize;
        // SAFETY: index is in [0, RING_CAPACITY) and the region covers all
        // slots.
        unsafe { self.mem.base().add(COUNTERS_SIZE + index * SLOT_SIZE) }
    }

    /// Zeroes both counters. Only the server role does this, at connection
    /// construction, before the peer attaches.
    pub fn reset(&self) {
        self.producer().store(0, Ordering::Release);
        self.consumer().store(0, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.producer().load(Ordering::Acquire) == self.consumer().load(Ordering::Acquire)
    }

    /// Publishes one framed message. Never blocks; a full ring is reported
    /// to the caller without advancing anything.
    pub fn push(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > SLOT_SIZE {
            return Err(IdmError::PayloadTooLarge(frame.len()));
        }
        let prod = self.producer().load(Ordering::Relaxed);
        let cons = self.consumer().load(Ordering::Acquire);
        if prod.wrapping_sub(cons) >= RING_CAPACITY {
            return Err(IdmError::RingFull);
        }

        // SAFETY: the slot at `prod` is unpublished (checked above), so the
        // producer owns it; the copy stays within the slot.
        unsafe {
            std::ptr::copy_nonoverlapping(frame.as_ptr(), self.slot_ptr(prod), frame.len());
        }

        // The slot contents must be visible before the counter advance is.
        fence(Ordering::Release);
        self.producer().store(prod.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeues the next framed message, if any.
    ///
    /// Returns `None` on an empty ring. A slot whose header fails validation
    /// is consumed and reported as `InvalidFrame` so a malformed producer
    /// cannot wedge the ring.
    pub fn pop_frame(&self) -> Option<Result<Vec<u8>>> {
        let prod = self.producer().load(Ordering::Acquire);
        let cons = self.consumer().load(Ordering::Relaxed);
        if prod == cons {
            return None;
        }

        // The producer advance must be visible before the slot read.
        fence(Ordering::Acquire);

        let slot = self.slot_ptr(cons);
        let mut header_bytes = [0u8; HEADER_SIZE];
        // SAFETY: the slot at `cons` is published and owned by the consumer
        // until the counter advances; reads stay within the slot.
        unsafe {
            std::ptr::copy_nonoverlapping(slot, header_bytes.as_mut_ptr(), HEADER_SIZE);
        }

        let header = match idm_header::read_from_prefix(&header_bytes[..]) {
            Some(h) if h.is_valid() => h,
            _ => {
                self.consumer().store(cons.wrapping_add(1), Ordering::Release);
                return Some(Err(IdmError::InvalidFrame));
            }
        };

        let frame_len = HEADER_SIZE + header.payload_len as usize;
        let mut frame = vec![0u8; frame_len];
        // SAFETY: frame_len <= SLOT_SIZE because the header passed
        // validation, so the read stays within the slot.
        unsafe {
            std::ptr::copy_nonoverlapping(slot, frame.as_mut_ptr(), frame_len);
        }

        // The advance releases the slot back to the producer only after the
        // copy above.
        self.consumer().store(cons.wrapping_add(1), Ordering::Release);
        Some(Ok(frame))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::message::Frame;
    use crate::message::Request;

    #[repr(C, align(64))]
    struct Aligned([u8; RING_BYTES]);

    struct HeapMemory(Box<Aligned>);

    impl HeapMemory {
        fn new() -> HeapMemory {
            HeapMemory(Box::new(Aligned([0; RING_BYTES])))
        }
    }

    // SAFETY: the boxed buffer is valid, 64-byte aligned, and lives as long
    // as the value.
    unsafe impl RingMemory for HeapMemory {
        fn base(&self) -> *mut u8 {
            self.0.as_ref().0.as_ptr() as *mut u8
        }

        fn len(&self) -> usize {
            RING_BYTES
        }
    }

    fn test_ring() -> Ring {
        Ring::new(Box::new(HeapMemory::new())).unwrap()
    }

    fn test_frame(seq: u64) -> Vec<u8> {
        Request::Alloc {
            size: seq,
            flags: 0,
        }
        .encode(2, 1, seq)
        .unwrap()
        .to_bytes()
    }

    #[test]
    fn empty_ring_pops_nothing() {
        let ring = test_ring();
        assert!(ring.is_empty());
        assert!(ring.pop_frame().is_none());
    }

    #[test]
    fn fifo_order() {
        let ring = test_ring();
        for seq in 0..10u64 {
            ring.push(&test_frame(seq)).unwrap();
        }
        for seq in 0..10u64 {
            let bytes = ring.pop_frame().unwrap().unwrap();
            let frame = Frame::decode(&bytes).unwrap();
            assert_eq!(frame.seq_num(), seq);
        }
        assert!(ring.pop_frame().is_none());
    }

    #[test]
    fn full_ring_rejects_push() {
        let ring = test_ring();
        for seq in 0..RING_CAPACITY as u64 {
            ring.push(&test_frame(seq)).unwrap();
        }
        assert!(matches!(ring.push(&test_frame(99)), Err(IdmError::RingFull)));
        // Draining one slot makes room again.
        ring.pop_frame().unwrap().unwrap();
        ring.push(&test_frame(99)).unwrap();
    }

    #[test]
    fn counters_wrap_across_capacity() {
        let ring = test_ring();
        for seq in 0..(RING_CAPACITY as u64 * 5) {
            ring.push(&test_frame(seq)).unwrap();
            let bytes = ring.pop_frame().unwrap().unwrap();
            assert_eq!(Frame::decode(&bytes).unwrap().seq_num(), seq);
        }
    }

    #[test]
    fn oversize_frame_rejected() {
        let ring = test_ring();
        let huge = vec![0u8; SLOT_SIZE + 1];
        assert!(matches!(
            ring.push(&huge),
            Err(IdmError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn corrupt_slot_is_consumed_not_stuck() {
        let ring = test_ring();
        let mut bad = test_frame(1);
        bad[0] ^= 0xff;
        ring.push(&bad).unwrap();
        ring.push(&test_frame(2)).unwrap();

        assert!(matches!(
            ring.pop_frame(),
            Some(Err(IdmError::InvalidFrame))
        ));
        // The ring advanced past the bad slot; the next frame is intact.
        let bytes = ring.pop_frame().unwrap().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap().seq_num(), 2);
    }

    #[test]
    fn cross_thread_fifo() {
        const COUNT: u64 = 2000;
        let ring = Arc::new(test_ring());

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for seq in 0..COUNT {
                    loop {
                        match ring.push(&test_frame(seq)) {
                            Ok(()) => break,
                            Err(IdmError::RingFull) => thread::yield_now(),
                            Err(e) => panic!("push failed: {}", e),
                        }
                    }
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for seq in 0..COUNT {
                    let bytes = loop {
                        match ring.pop_frame() {
                            Some(Ok(bytes)) => break bytes,
                            Some(Err(e)) => panic!("pop failed: {}", e),
                            None => thread::yield_now(),
                        }
                    };
                    assert_eq!(Frame::decode(&bytes).unwrap().seq_num(), seq);
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
