use std::fmt;

use static_assertions::const_assert;

mod allocator;
mod arena;
mod buffer;
mod link;

pub use allocator::{AllocatorCapabilities, AllocatorConfig, BufferAllocator, BufferUsage};
pub use arena::{ShmemArena, SlotIndex};
pub use buffer::{
    BackingDescriptor, BackingKind, BufferDescriptor, LockMode, ReadLockGuard, SharedBuffer,
    WriteLockGuard,
};
pub use link::{GpuHandleToken, LinkId, RemoteAllocatorLink};

/// Default byte length of one shared-memory slot. Large enough for a
/// 1080p RGBA frame with room to spare.
pub const DEFAULT_SHMEM_SLOT_LEN: usize = 16 << 20;
pub const DEFAULT_SHMEM_SLOT_COUNT: u32 = 64;

// Slot mappings must stay page-aligned or the remote side cannot map them.
const_assert!(DEFAULT_SHMEM_SLOT_LEN % 4096 == 0);
const_assert!(DEFAULT_SHMEM_SLOT_COUNT > 0);

/// Allocator-scoped identity of one shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferSerial(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAllocError {
    ZeroSize,
    SizeOverflow,
    ExceedsPlatformLimit,
    SlotSpaceExhausted,
    ChannelClosed,
}

impl fmt::Display for BufferAllocError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferAllocError::ZeroSize => {
                write!(formatter, "buffer allocation requested a zero-area image")
            }
            BufferAllocError::SizeOverflow => {
                write!(formatter, "buffer byte length overflows the address space")
            }
            BufferAllocError::ExceedsPlatformLimit => {
                write!(formatter, "buffer byte length exceeds the platform slot limit")
            }
            BufferAllocError::SlotSpaceExhausted => {
                write!(formatter, "shared-memory arena has no free slots")
            }
            BufferAllocError::ChannelClosed => {
                write!(formatter, "remote allocator channel is closed")
            }
        }
    }
}

impl std::error::Error for BufferAllocError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLockError {
    AlreadyLocked,
    NoCpuMapping,
}

impl fmt::Display for BufferLockError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferLockError::AlreadyLocked => {
                write!(formatter, "buffer already holds a conflicting lock")
            }
            BufferLockError::NoCpuMapping => {
                write!(formatter, "buffer backing has no CPU mapping")
            }
        }
    }
}

impl std::error::Error for BufferLockError {}
