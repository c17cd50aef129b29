//! # Shared-Memory Key Set
//!
//! A set of short text keys owned by one long-lived server process and used
//! by any number of short-lived client processes. Clients and server talk
//! only through a fixed-size POSIX shared-memory segment: no sockets, pipes
//! or message queues are involved.
//!
//! The segment holds a ring of request slots guarded by a process-shared
//! mutex, plus a counting semaphore of pending requests:
//!
//! - A **client** takes the mutex, claims the slot after the tail, writes the
//!   operation and key, marks the slot `SentToServer`, advances the tail and
//!   posts the semaphore, then releases the mutex. It then polls the slot
//!   until the server has marked it `SentToClient`, reads the result and
//!   returns the slot to `Empty`.
//!
//! - The **server** waits on the semaphore, takes the mutex and applies every
//!   submitted slot, in ring order, to a [`ConcurrentSet`], publishing each
//!   result before releasing the mutex again.
//!
//! ## Polling
//!
//! Slots have no wake-up primitive of their own, so a waiting client keeps
//! taking and releasing the ring mutex until its answer is there, backing off
//! between polls. Latency is bounded by how quickly the server drains, not by
//! a kernel wake-up.
//!
//! ## Capacity
//!
//! The ring holds [`CAPACITY`] slots, claimed strictly in ring order.
//! Claiming a slot that is still in use is a ring overrun, reported as
//! [`ChannelError::Overrun`] and treated as fatal by the bundled binary. A
//! single client that is slow to collect its answer is enough: once
//! `CAPACITY - 1` later requests have gone round, the ring is back at its
//! slot. There is no back-pressure.
//!
//! ## Modules
//!
//! - [`hash_set`]: the bucket-striped set, usable on its own.
//! - [`layout`]: the segment layout shared by every build.
//! - [`client`] / [`server`]: the two ends of the ring protocol.
//! - [`repl`]: the `OP KEY` command reader used by the client binary.
//!
//! ## License
//!
//! Licensed under the terms of the **GNU Lesser General Public License**,
//! version 3.0, or (at your option) any later version.
//!
//! See <https://www.gnu.org/licenses/lgpl-3.0.html> for details.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only supports Linux (process-shared unnamed semaphores).");

pub mod client;
pub mod config;
pub mod hash_set;
pub mod layout;
pub mod repl;
pub mod server;
pub mod stats;

mod channel;
mod error;
mod mmap;
mod region;
mod sync;

pub use channel::{Connector, connect, local_channel, serve};
pub use client::{Client, Ticket};
pub use config::{DEFAULT_BUCKET_COUNT, ServerConfig, resolve_bucket_count};
pub use error::{ChannelError, RequestError, SegmentError, SyncError};
pub use hash_set::ConcurrentSet;
pub use layout::{CAPACITY, MAX_KEY_LEN, Operation, SEGMENT_NAME, SlotState};
pub use region::{HeapRegion, Region, ShmRegion};
pub use server::{KeySet, Server, ServerStats};
pub use stats::{Latencies, mono_time_ns};
pub use sync::{ShmMutex, ShmMutexGuard, ShmSemaphore};
