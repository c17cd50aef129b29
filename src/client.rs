use crate::error::{ChannelError, RequestError};
use crate::layout::{MAX_KEY_LEN, Operation, SlotState, next_index};
use crate::region::Region;
use crossbeam_utils::Backoff;
use std::sync::Arc;

/// Checks a key before it is allowed anywhere near the ring.
///
/// Keys must be non-empty, free of NUL bytes, and strictly shorter than
/// [`MAX_KEY_LEN`] so the terminator fits in the slot.
pub fn validate_key(key: &[u8]) -> Result<(), RequestError> {
    if key.len() >= MAX_KEY_LEN {
        return Err(RequestError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    if key.is_empty() {
        return Err(RequestError::EmptyKey);
    }
    if key.contains(&0) {
        return Err(RequestError::KeyContainsNul);
    }
    Ok(())
}

/// A submitted request whose response has not been collected yet.
///
/// Must be passed to [`Client::wait`]; until then the slot stays out of
/// circulation.
#[derive(Debug)]
#[must_use = "the slot is only released by Client::wait"]
pub struct Ticket {
    slot: usize,
}

impl Ticket {
    /// Ring index of the claimed slot.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Producer side of the ring.
///
/// A client issues one request at a time: [`Client::request`] submits and then
/// polls until the server has answered. Any number of clients, in any number
/// of processes, may share one ring.
pub struct Client<R: Region> {
    region: Arc<R>,
}

impl<R: Region> Client<R> {
    pub fn new(region: Arc<R>) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &Arc<R> {
        &self.region
    }

    /// Claims the slot after the tail and hands the request to the server.
    ///
    /// The counting semaphore is posted before the ring lock is released, so
    /// the server never observes a submitted slot without its unit of work.
    ///
    /// Returns [`ChannelError::Overrun`] when the slot after the tail is still
    /// in use. Slots are claimed strictly in ring order, so this happens as
    /// soon as the ring laps a single slot whose owner has not collected its
    /// answer yet, even with only a few requests in flight.
    pub fn enqueue(&self, operation: Operation, key: &[u8]) -> Result<Ticket, ChannelError> {
        validate_key(key)?;

        let ring = self.region.ring();
        let mut guard = ring.lock()?;

        let slot = next_index(guard.tail());
        if !guard.slot(slot).is(SlotState::Empty) {
            return Err(ChannelError::Overrun { slot });
        }

        guard.slot_mut(slot).submit(operation, key);
        guard.set_tail(slot);

        ring.available().post()?;
        guard.unlock()?;

        tracing::trace!(slot, op = %operation.symbol(), "request submitted");
        Ok(Ticket { slot })
    }

    /// Polls the ticket's slot until the server has answered, then collects
    /// the result and returns the slot to `Empty`.
    ///
    /// The slot has no wake-up primitive of its own: each poll takes the ring
    /// lock, reads the state and releases it, backing off between polls.
    pub fn wait(&self, ticket: Ticket) -> Result<bool, ChannelError> {
        let ring = self.region.ring();
        let backoff = Backoff::new();

        loop {
            let guard = ring.lock()?;
            let answered = guard.slot(ticket.slot).is(SlotState::SentToClient);
            guard.unlock()?;
            if answered {
                break;
            }
            backoff.snooze();
        }

        let mut guard = ring.lock()?;
        let slot = guard.slot_mut(ticket.slot);
        let result = slot.result();
        slot.release();
        guard.unlock()?;
        Ok(result)
    }

    /// Submits one request and blocks until its result is available.
    pub fn request(&self, operation: Operation, key: &[u8]) -> Result<bool, ChannelError> {
        let ticket = self.enqueue(operation, key)?;
        self.wait(ticket)
    }

    pub fn insert(&self, key: &[u8]) -> Result<bool, ChannelError> {
        self.request(Operation::Insert, key)
    }

    pub fn remove(&self, key: &[u8]) -> Result<bool, ChannelError> {
        self.request(Operation::Remove, key)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, ChannelError> {
        self.request(Operation::Query, key)
    }
}

impl<R: Region> Clone for Client<R> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
        }
    }
}
