//! Shared-segment layout.
//!
//! This is the binary contract between the server and every client build.
//! A segment holds one [`SharedRing`]:
//!
//! ```text
//! [ SchemaHeader | ShmMutex | ShmSemaphore | tail: i32 | Slot; CAPACITY ]
//! ```
//!
//! `MAX_KEY_LEN`, `CAPACITY` and the segment name must match on both sides.
//! The schema header lets a client refuse to attach to a segment laid out by a
//! different build instead of reinterpreting its memory.

use crate::error::{RequestError, SegmentError, SyncError};
use crate::sync::{ShmMutex, ShmMutexGuard, ShmSemaphore};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size of the key buffer in each slot. Keys must be strictly shorter, leaving
/// room for the terminating NUL.
pub const MAX_KEY_LEN: usize = 1024;

/// Number of slots in the ring.
pub const CAPACITY: usize = 128;

/// Well-known segment name shared by server and clients.
pub const SEGMENT_NAME: &str = "/shm_keyset";

pub const SCHEMA_MAGIC: u64 = 0x5445_5359_454B_4D53; // "SMKEYSET"
pub const SCHEMA_VERSION: u32 = 1;

/// Tail position of a freshly initialized ring.
pub const ORIGIN: usize = 0;

const _: () = assert!(CAPACITY > 1 && CAPACITY <= i32::MAX as usize);
const _: () = assert!(MAX_KEY_LEN > 1 && MAX_KEY_LEN <= u32::MAX as usize);

/// Operation carried by a request.
///
/// The discriminant is the tag byte written into the slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert = b'+',
    Remove = b'-',
    Query = b'?',
}

impl Operation {
    /// Parses the command-line symbol (`+`, `-` or `?`).
    pub fn from_symbol(symbol: char) -> Result<Self, RequestError> {
        match symbol {
            '+' => Ok(Operation::Insert),
            '-' => Ok(Operation::Remove),
            '?' => Ok(Operation::Query),
            other => Err(RequestError::UnknownOperation(other)),
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::from_symbol(tag as char).ok()
    }

    pub fn symbol(self) -> char {
        self as u8 as char
    }
}

/// Ownership state of a slot.
///
/// Always cycles `Empty -> SentToServer -> SentToClient -> Empty`. The client
/// owns the slot in `Empty` and `SentToClient`, the server in `SentToServer`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty = 0,
    SentToServer = 1,
    SentToClient = 2,
}

impl SlotState {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(SlotState::Empty),
            1 => Some(SlotState::SentToServer),
            2 => Some(SlotState::SentToClient),
            _ => None,
        }
    }
}

/// One request/response record.
#[repr(C)]
pub struct Slot {
    operation: u8,
    key: [u8; MAX_KEY_LEN],
    result: u8,
    state: i32,
}

impl Slot {
    /// Decoded state, or `None` if the raw value is not a known state.
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_raw(self.state)
    }

    #[inline]
    pub fn is(&self, state: SlotState) -> bool {
        self.state == state as i32
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_tag(self.operation)
    }

    /// Key bytes up to the terminating NUL.
    pub fn key(&self) -> &[u8] {
        let len = self
            .key
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_KEY_LEN);
        &self.key[..len]
    }

    pub fn result(&self) -> bool {
        self.result != 0
    }

    /// Client side: fills an empty slot and hands it to the server.
    pub(crate) fn submit(&mut self, operation: Operation, key: &[u8]) {
        debug_assert!(self.is(SlotState::Empty));
        debug_assert!(key.len() < MAX_KEY_LEN);
        self.operation = operation as u8;
        self.key[..key.len()].copy_from_slice(key);
        self.key[key.len()] = 0;
        self.result = 0;
        self.state = SlotState::SentToServer as i32;
    }

    /// Server side: publishes the result back to the client.
    pub(crate) fn complete(&mut self, result: bool) {
        debug_assert!(self.is(SlotState::SentToServer));
        self.result = result as u8;
        self.state = SlotState::SentToClient as i32;
    }

    /// Client side: releases the slot for reuse after reading the result.
    pub(crate) fn release(&mut self) {
        debug_assert!(self.is(SlotState::SentToClient));
        self.state = SlotState::Empty as i32;
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("operation", &self.operation())
            .field("key", &String::from_utf8_lossy(self.key()))
            .field("result", &self.result())
            .field("state", &self.state())
            .finish()
    }
}

/// Build parameters recorded at the start of the segment.
#[repr(C)]
pub struct SchemaHeader {
    /// Written last by the server; zero until the segment is usable.
    magic: AtomicU64,
    version: u32,
    max_key_len: u32,
    capacity: u32,
    _reserved: u32,
    segment_size: u64,
}

/// Mutable part of the ring, only touched while the ring mutex is held.
#[repr(C)]
struct RingState {
    tail: i32,
    slots: [Slot; CAPACITY],
}

/// The complete contents of a shared segment.
#[repr(C)]
pub struct SharedRing {
    header: SchemaHeader,
    lock: ShmMutex,
    available: ShmSemaphore,
    state: UnsafeCell<RingState>,
}

unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl SharedRing {
    pub const SIZE: usize = std::mem::size_of::<SharedRing>();

    /// Zeroes the region and initializes every field in place: both
    /// primitives, tail at [`ORIGIN`], every slot `Empty`. The magic is stored
    /// last so attaching clients never observe a half-built ring.
    ///
    /// # Safety
    ///
    /// `this` must point to `SIZE` writable bytes, suitably aligned, that no
    /// other thread or process is using.
    pub(crate) unsafe fn init(this: *mut SharedRing) -> Result<(), SyncError> {
        unsafe {
            std::ptr::write_bytes(this.cast::<u8>(), 0, Self::SIZE);

            let header = &raw mut (*this).header;
            (*header).version = SCHEMA_VERSION;
            (*header).max_key_len = MAX_KEY_LEN as u32;
            (*header).capacity = CAPACITY as u32;
            (*header).segment_size = Self::SIZE as u64;

            ShmMutex::init(&raw mut (*this).lock)?;
            ShmSemaphore::init(&raw mut (*this).available, 0)?;

            let state = (*this).state.get();
            (*state).tail = ORIGIN as i32;
            for slot in (*state).slots.iter_mut() {
                slot.state = SlotState::Empty as i32;
            }

            (*this).header.magic.store(SCHEMA_MAGIC, Ordering::Release);
        }
        Ok(())
    }

    /// Checks that the segment was initialized by a server with the same
    /// build parameters.
    pub fn verify_schema(&self) -> Result<(), SegmentError> {
        let header = &self.header;
        if header.magic.load(Ordering::Acquire) != SCHEMA_MAGIC {
            return Err(SegmentError::NotInitialized);
        }

        let fields: [(&'static str, u64, u64); 4] = [
            ("version", SCHEMA_VERSION as u64, header.version as u64),
            ("max_key_len", MAX_KEY_LEN as u64, header.max_key_len as u64),
            ("capacity", CAPACITY as u64, header.capacity as u64),
            ("segment_size", Self::SIZE as u64, header.segment_size),
        ];
        for (field, expected, found) in fields {
            if expected != found {
                return Err(SegmentError::SchemaMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Acquires the ring mutex. Every read or write of the tail or of a slot
    /// goes through the returned guard.
    pub fn lock(&self) -> Result<RingGuard<'_>, SyncError> {
        let guard = self.lock.lock()?;
        Ok(RingGuard { ring: self, guard })
    }

    /// The counting semaphore: number of submitted slots not yet consumed by
    /// the server's drain.
    pub fn available(&self) -> &ShmSemaphore {
        &self.available
    }

    /// # Safety
    ///
    /// No process may use the ring afterwards.
    pub(crate) unsafe fn destroy(&self) {
        unsafe {
            self.lock.destroy();
            self.available.destroy();
        }
    }
}

/// Exclusive access to the tail and the slots.
pub struct RingGuard<'a> {
    ring: &'a SharedRing,
    guard: ShmMutexGuard<'a>,
}

impl RingGuard<'_> {
    fn state(&self) -> &RingState {
        unsafe { &*self.ring.state.get() }
    }

    fn state_mut(&mut self) -> &mut RingState {
        unsafe { &mut *self.ring.state.get() }
    }

    /// Index of the slot most recently claimed by a client.
    pub fn tail(&self) -> usize {
        self.state().tail as usize
    }

    pub(crate) fn set_tail(&mut self, tail: usize) {
        debug_assert!(tail < CAPACITY);
        self.state_mut().tail = tail as i32;
    }

    pub fn slot(&self, index: usize) -> &Slot {
        &self.state().slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.state_mut().slots[index]
    }

    pub fn unlock(self) -> Result<(), SyncError> {
        self.guard.unlock()
    }
}

/// Index following `index` in ring order.
#[inline(always)]
pub fn next_index(index: usize) -> usize {
    (index + 1) % CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{HeapRegion, Region};

    #[test]
    fn operation_symbols() {
        assert_eq!(Operation::from_symbol('+'), Ok(Operation::Insert));
        assert_eq!(Operation::from_symbol('-'), Ok(Operation::Remove));
        assert_eq!(Operation::from_symbol('?'), Ok(Operation::Query));
        assert_eq!(
            Operation::from_symbol('*'),
            Err(RequestError::UnknownOperation('*'))
        );
        assert_eq!(Operation::from_tag(b'?'), Some(Operation::Query));
        assert_eq!(Operation::from_tag(0), None);
        assert_eq!(Operation::Remove.symbol(), '-');
    }

    #[test]
    fn slot_state_raw_values() {
        assert_eq!(SlotState::from_raw(0), Some(SlotState::Empty));
        assert_eq!(SlotState::from_raw(1), Some(SlotState::SentToServer));
        assert_eq!(SlotState::from_raw(2), Some(SlotState::SentToClient));
        assert_eq!(SlotState::from_raw(3), None);
    }

    #[test]
    fn init_leaves_every_slot_empty_and_tail_at_origin() {
        let region = HeapRegion::new().unwrap();
        let ring = region.ring();
        ring.verify_schema().unwrap();
        assert_eq!(ring.available().value().unwrap(), 0);

        let guard = ring.lock().unwrap();
        assert_eq!(guard.tail(), ORIGIN);
        for i in 0..CAPACITY {
            assert_eq!(guard.slot(i).state(), Some(SlotState::Empty));
            assert!(!guard.slot(i).result());
            assert!(guard.slot(i).key().is_empty());
        }
        guard.unlock().unwrap();
    }

    #[test]
    fn slot_cycle_and_key_termination() {
        let region = HeapRegion::new().unwrap();
        let mut guard = region.ring().lock().unwrap();

        let slot = guard.slot_mut(5);
        slot.submit(Operation::Insert, b"a-longer-key");
        slot.complete(true);
        slot.release();

        // a shorter key must not pick up the tail of the previous one
        let slot = guard.slot_mut(5);
        slot.submit(Operation::Query, b"abc");
        assert_eq!(slot.key(), b"abc");
        assert_eq!(slot.operation(), Some(Operation::Query));
        assert!(!slot.result(), "result is reset on submit");
        assert_eq!(slot.state(), Some(SlotState::SentToServer));

        slot.complete(true);
        assert_eq!(slot.state(), Some(SlotState::SentToClient));
        assert!(slot.result());

        slot.release();
        assert_eq!(slot.state(), Some(SlotState::Empty));
        guard.unlock().unwrap();
    }

    #[test]
    fn longest_key_fits_with_terminator() {
        let region = HeapRegion::new().unwrap();
        let mut guard = region.ring().lock().unwrap();
        let key = vec![b'k'; MAX_KEY_LEN - 1];
        guard.slot_mut(0).submit(Operation::Insert, &key);
        assert_eq!(guard.slot(0).key(), &key[..]);
        guard.unlock().unwrap();
    }

    #[test]
    fn schema_check_rejects_foreign_segments() {
        let region = HeapRegion::new().unwrap();
        let header = unsafe { &raw mut (*region.as_ptr()).header };

        unsafe { (*header).capacity = 64 };
        match region.ring().verify_schema() {
            Err(SegmentError::SchemaMismatch {
                field,
                expected,
                found,
            }) => {
                assert_eq!(field, "capacity");
                assert_eq!(expected, CAPACITY as u64);
                assert_eq!(found, 64);
            }
            other => panic!("expected capacity mismatch, got {:?}", other),
        }
        unsafe { (*header).capacity = CAPACITY as u32 };
        region.ring().verify_schema().unwrap();

        region.ring().header.magic.store(0, Ordering::Release);
        assert!(matches!(
            region.ring().verify_schema(),
            Err(SegmentError::NotInitialized)
        ));
    }

    #[test]
    fn next_index_wraps() {
        assert_eq!(next_index(0), 1);
        assert_eq!(next_index(CAPACITY - 1), 0);
    }
}
