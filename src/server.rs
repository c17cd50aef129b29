use crate::error::SyncError;
use crate::hash_set::ConcurrentSet;
use crate::layout::{ORIGIN, Operation, SlotState, next_index};
use crate::region::Region;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Keys as they travel through the ring.
pub type KeySet = ConcurrentSet<Vec<u8>>;

/// Counts of applied requests, by operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub inserts: u64,
    pub removes: u64,
    pub queries: u64,
    /// Drains that applied at least one request.
    pub batches: u64,
}

impl ServerStats {
    pub fn total(&self) -> u64 {
        self.inserts + self.removes + self.queries
    }
}

/// Consumer side of the ring.
///
/// Owns the key set and applies every submitted request to it, strictly in
/// ring order. There must be exactly one server per ring.
pub struct Server<R: Region> {
    region: Arc<R>,
    set: KeySet,
    /// Index of the last slot this server has applied.
    last_seen: usize,
    stats: ServerStats,
}

impl<R: Region> Server<R> {
    /// Wraps a freshly initialized ring, whose tail is at [`ORIGIN`].
    pub fn new(region: Arc<R>, set: KeySet) -> Self {
        Self {
            region,
            set,
            last_seen: ORIGIN,
            stats: ServerStats::default(),
        }
    }

    pub fn region(&self) -> &Arc<R> {
        &self.region
    }

    pub fn set(&self) -> &KeySet {
        &self.set
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Blocks until at least one request is pending.
    ///
    /// The semaphore is put back right away: this wait only gates the drain,
    /// the per-slot decrements happen inside [`Server::drain`].
    pub fn wait_for_work(&self) -> Result<(), SyncError> {
        let available = self.region.ring().available();
        available.wait()?;
        available.post()
    }

    /// Like [`Server::wait_for_work`], giving up after `timeout`.
    ///
    /// Returns `false` if no work arrived in time.
    pub fn wait_for_work_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        let available = self.region.ring().available();
        if !available.wait_timeout(timeout)? {
            return Ok(false);
        }
        available.post()?;
        Ok(true)
    }

    /// Applies every submitted request under a single hold of the ring lock.
    ///
    /// Walks forward from the last applied slot until it catches up with the
    /// tail. A ring holding exactly `CAPACITY` pending requests has its tail
    /// back on the last applied slot, so the walk also continues while the
    /// next slot is still `SentToServer`.
    ///
    /// Returns the number of requests applied.
    pub fn drain(&mut self) -> Result<usize, SyncError> {
        let ring = self.region.ring();
        let mut guard = ring.lock()?;
        let tail = guard.tail();

        let mut applied = 0;
        loop {
            let next = next_index(self.last_seen);
            let pending = guard.slot(next).is(SlotState::SentToServer);
            if self.last_seen == tail && !pending {
                break;
            }
            debug_assert!(pending, "slot {} between last seen and tail is not pending", next);
            self.last_seen = next;

            let slot = guard.slot_mut(next);
            let result = match slot.operation() {
                Some(Operation::Insert) => {
                    self.set.insert(slot.key().to_vec());
                    self.stats.inserts += 1;
                    tracing::debug!(key = %String::from_utf8_lossy(slot.key()), "added");
                    true
                }
                Some(Operation::Remove) => {
                    self.set.remove(slot.key());
                    self.stats.removes += 1;
                    tracing::debug!(key = %String::from_utf8_lossy(slot.key()), "removed");
                    false
                }
                Some(Operation::Query) => {
                    let found = self.set.contains(slot.key());
                    self.stats.queries += 1;
                    tracing::debug!(key = %String::from_utf8_lossy(slot.key()), found, "query");
                    found
                }
                None => {
                    tracing::warn!(index = next, ?slot, "ignoring slot with unknown operation tag");
                    false
                }
            };
            slot.complete(result);

            // consume the unit of work this slot was posted with
            ring.available().wait()?;
            applied += 1;
        }

        guard.unlock()?;
        if applied > 0 {
            self.stats.batches += 1;
            tracing::trace!(applied, last_seen = self.last_seen, "drained batch");
        }
        Ok(applied)
    }

    /// Serves forever. Only returns on a primitive failure.
    pub fn run(&mut self) -> Result<Infallible, SyncError> {
        loop {
            self.wait_for_work()?;
            self.drain()?;
        }
    }

    /// Serves until `stop` is set, checking it at least every `poll`.
    pub fn run_until(&mut self, stop: &AtomicBool, poll: Duration) -> Result<(), SyncError> {
        while !stop.load(Ordering::Acquire) {
            if self.wait_for_work_timeout(poll)? {
                self.drain()?;
            }
        }
        tracing::info!(stats = ?self.stats, "server stopped");
        Ok(())
    }
}
