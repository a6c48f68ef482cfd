use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arena::ShmemArena;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one remote allocator channel. Producer frame
/// objects key their pre-bound textures by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// Opaque exported handle of a GPU-native buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuHandleToken(pub u64);

/// Client-side end of the allocator channel shared with the remote
/// compositor process.
///
/// `close` models compositor teardown or restart: the open flag flips for
/// every buffer holding a back-reference, and parked slots are reclaimed in
/// bulk since the remote references they were waiting on are gone.
#[derive(Debug)]
pub struct RemoteAllocatorLink {
    id: LinkId,
    open: AtomicBool,
    arena: ShmemArena,
    next_gpu_token: AtomicU64,
}

impl RemoteAllocatorLink {
    pub fn new(slot_count: u32, slot_len: usize) -> Self {
        Self {
            id: LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)),
            open: AtomicBool::new(true),
            arena: ShmemArena::new(slot_count, slot_len),
            next_gpu_token: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.arena.reclaim_all_parked();
    }

    pub fn arena(&self) -> &ShmemArena {
        &self.arena
    }

    pub(crate) fn next_gpu_token(&self) -> GpuHandleToken {
        GpuHandleToken(self.next_gpu_token.fetch_add(1, Ordering::Relaxed))
    }
}
