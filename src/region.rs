use crate::error::{SegmentError, SyncError};
use crate::layout::SharedRing;
use crate::mmap::{
    create_shared_memory, open_shared_memory, unlink_shared_memory, unmap_shared_memory,
};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// Storage holding one [`SharedRing`].
///
/// Server and clients only ever see the ring through this trait, so the same
/// protocol code runs over a POSIX segment shared between processes and over
/// a heap allocation shared between threads.
pub trait Region: Send + Sync {
    fn ring(&self) -> &SharedRing;
}

/// A ring allocated on the heap, for use within a single process.
///
/// The primitives are still initialized as process-shared; they simply never
/// leave this process.
#[derive(Debug)]
pub struct HeapRegion {
    ptr: NonNull<SharedRing>,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Allocates a zeroed ring and initializes it the same way the server
    /// initializes a fresh segment.
    pub fn new() -> Result<Self, SyncError> {
        let layout = Layout::new::<SharedRing>();
        let raw = unsafe { alloc_zeroed(layout) } as *mut SharedRing;
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        if let Err(err) = unsafe { SharedRing::init(ptr.as_ptr()) } {
            unsafe { dealloc(ptr.as_ptr().cast(), layout) };
            return Err(err);
        }
        Ok(Self { ptr })
    }

    #[cfg(test)]
    pub(crate) fn as_ptr(&self) -> *mut SharedRing {
        self.ptr.as_ptr()
    }
}

impl Region for HeapRegion {
    #[inline(always)]
    fn ring(&self) -> &SharedRing {
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe {
            self.ptr.as_ref().destroy();
            dealloc(self.ptr.as_ptr().cast(), Layout::new::<SharedRing>());
        }
    }
}

/// A ring living in a named POSIX shared-memory segment.
///
/// The server [`create`](ShmRegion::create)s the segment and owns its name:
/// dropping the owning region unmaps it and unlinks the name. Clients
/// [`open`](ShmRegion::open) an existing segment and only unmap on drop.
#[derive(Debug)]
pub struct ShmRegion {
    ptr: NonNull<SharedRing>,
    name: String,
    owner: bool,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates and initializes the segment.
    ///
    /// A segment already present under `name` is left over from a server that
    /// did not shut down cleanly; it is unlinked and replaced. Clients still
    /// mapping the old segment keep talking to it and will never get answers,
    /// which is why only one server may run at a time.
    pub fn create(name: &str) -> Result<Self, SegmentError> {
        if unlink_shared_memory(name)? {
            tracing::warn!(segment = name, "removed stale shared memory segment");
        }

        let ptr = create_shared_memory(name, SharedRing::SIZE)?.cast::<SharedRing>();
        let region = Self {
            ptr,
            name: name.to_owned(),
            owner: true,
        };
        unsafe { SharedRing::init(ptr.as_ptr())? };

        tracing::info!(
            segment = name,
            size = SharedRing::SIZE,
            "shared memory segment initialized"
        );
        Ok(region)
    }

    /// Attaches to a segment created by a running server.
    ///
    /// Fails if the segment does not exist, has a different size, or was laid
    /// out by a build with different parameters.
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        let ptr = match open_shared_memory(name, SharedRing::SIZE)? {
            Ok(ptr) => ptr.cast::<SharedRing>(),
            Err(found) => {
                return Err(SegmentError::SizeMismatch {
                    expected: SharedRing::SIZE,
                    found,
                });
            }
        };
        let region = Self {
            ptr,
            name: name.to_owned(),
            owner: false,
        };
        region.ring().verify_schema()?;

        tracing::debug!(segment = name, "attached to shared memory segment");
        Ok(region)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Region for ShmRegion {
    #[inline(always)]
    fn ring(&self) -> &SharedRing {
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for ShmRegion {
    /// Unmaps the segment, and unlinks it when this region created it.
    ///
    /// The primitives are not destroyed: clients may still hold the mapping.
    ///
    /// # Panics
    ///
    /// Panics if unmapping fails, as the teardown cannot be completed safely.
    fn drop(&mut self) {
        unsafe {
            unmap_shared_memory(self.ptr.cast(), SharedRing::SIZE)
                .expect("ShmRegion::drop failed to unmap");
        }
        if self.owner {
            match unlink_shared_memory(&self.name) {
                Ok(true) => tracing::info!(segment = %self.name, "shared memory segment unlinked"),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(segment = %self.name, error = %err, "failed to unlink segment")
                }
            }
        }
    }
}
