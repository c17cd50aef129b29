use crate::client::Client;
use crate::config::ServerConfig;
use crate::error::{SegmentError, SyncError};
use crate::region::{HeapRegion, Region, ShmRegion};
use crate::server::{KeySet, Server};
use std::sync::Arc;

/// Creates the shared segment and the server that owns it.
///
/// This is the primary constructor for the inter-process channel. Any segment
/// left under the same name by an earlier server is replaced. Dropping the
/// returned server unlinks the segment.
///
/// The segment name must follow POSIX shared-memory naming rules: it starts
/// with `'/'` and contains no other `'/'`.
///
/// # Panics
///
/// Panics if `config.bucket_count` is zero.
pub fn serve(config: &ServerConfig) -> Result<Server<ShmRegion>, SegmentError> {
    let region = ShmRegion::create(&config.segment_name)?;
    tracing::info!(
        segment = %config.segment_name,
        buckets = config.bucket_count,
        "server ready"
    );
    Ok(Server::new(
        Arc::new(region),
        KeySet::new(config.bucket_count),
    ))
}

/// Attaches a client to the segment of a running server.
///
/// # Errors
///
/// Fails if no server has created the segment, or if the segment was laid out
/// by a build with a different key length, capacity or schema version.
pub fn connect(segment_name: &str) -> Result<Client<ShmRegion>, SegmentError> {
    Ok(Client::new(Arc::new(ShmRegion::open(segment_name)?)))
}

/// Creates an in-process channel backed by a [`HeapRegion`].
///
/// The ring has the same layout and uses the same primitives as the shared
/// variant; it is meant for embedding the server in a process whose own
/// threads act as clients.
///
/// # Panics
///
/// Panics if `bucket_count` is zero.
pub fn local_channel(
    bucket_count: usize,
) -> Result<(Server<HeapRegion>, Connector<HeapRegion>), SyncError> {
    let region = Arc::new(HeapRegion::new()?);
    Ok((
        Server::new(region.clone(), KeySet::new(bucket_count)),
        Connector { region },
    ))
}

/// Hands out clients for one ring.
#[derive(Debug)]
pub struct Connector<R: Region> {
    region: Arc<R>,
}

impl<R: Region> Connector<R> {
    pub fn client(&self) -> Client<R> {
        Client::new(self.region.clone())
    }
}

impl<R: Region> Clone for Connector<R> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
        }
    }
}
