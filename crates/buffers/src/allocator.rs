use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use compositor_protocol::{ImageSize, PixelFormat, TextureFlags};

use crate::buffer::SharedBuffer;
use crate::link::RemoteAllocatorLink;
use crate::{
    BufferAllocError, BufferSerial, DEFAULT_SHMEM_SLOT_COUNT, DEFAULT_SHMEM_SLOT_LEN,
};

/// How the producer intends to fill the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Pixels written by the CPU under a scoped write lock, then uploaded.
    CpuPixels,
    /// Prefer an exported GPU-native handle; falls back to CPU-backed shmem
    /// when the compositor cannot import native handles.
    GpuExport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorCapabilities {
    pub supports_gpu_native: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub shmem_slot_count: u32,
    pub shmem_slot_len: usize,
    pub capabilities: AllocatorCapabilities,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            shmem_slot_count: DEFAULT_SHMEM_SLOT_COUNT,
            shmem_slot_len: DEFAULT_SHMEM_SLOT_LEN,
            capabilities: AllocatorCapabilities {
                supports_gpu_native: false,
            },
        }
    }
}

/// Produces `SharedBuffer`s appropriate to a requested format, size, and
/// usage, choosing between CPU-backed shmem and GPU-native backings based on
/// the consuming compositor's capabilities.
#[derive(Debug)]
pub struct BufferAllocator {
    link: Arc<RemoteAllocatorLink>,
    capabilities: AllocatorCapabilities,
    next_serial: AtomicU64,
}

impl BufferAllocator {
    pub fn new() -> Self {
        Self::with_config(AllocatorConfig::default())
    }

    pub fn with_config(config: AllocatorConfig) -> Self {
        Self {
            link: Arc::new(RemoteAllocatorLink::new(
                config.shmem_slot_count,
                config.shmem_slot_len,
            )),
            capabilities: config.capabilities,
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn link(&self) -> &Arc<RemoteAllocatorLink> {
        &self.link
    }

    pub fn capabilities(&self) -> AllocatorCapabilities {
        self.capabilities
    }

    /// Allocate a buffer for one frame. Every failure is scoped to this one
    /// request; the allocator stays usable afterwards.
    pub fn allocate(
        &self,
        format: PixelFormat,
        size: ImageSize,
        usage: BufferUsage,
    ) -> Result<SharedBuffer, BufferAllocError> {
        self.allocate_flagged(format, size, usage, TextureFlags::default())
    }

    /// `allocate` with explicit texture flags stamped on the buffer. The
    /// publishing client requires its own flags to be a subset of every
    /// buffer it forwards.
    pub fn allocate_flagged(
        &self,
        format: PixelFormat,
        size: ImageSize,
        usage: BufferUsage,
        flags: TextureFlags,
    ) -> Result<SharedBuffer, BufferAllocError> {
        if !self.link.is_open() {
            return Err(BufferAllocError::ChannelClosed);
        }
        if size.is_empty() {
            return Err(BufferAllocError::ZeroSize);
        }
        let byte_len = size
            .byte_len(format)
            .ok_or(BufferAllocError::SizeOverflow)?;

        if usage == BufferUsage::GpuExport && self.capabilities.supports_gpu_native {
            let token = self.link.next_gpu_token();
            return Ok(SharedBuffer::new_gpu_native(
                self.assign_serial(),
                format,
                size,
                flags,
                token,
                Arc::clone(&self.link),
            ));
        }

        let slot_len = self.link.arena().slot_len();
        if byte_len > slot_len as u64 {
            return Err(BufferAllocError::ExceedsPlatformLimit);
        }
        let slot = self
            .link
            .arena()
            .allocate_slot()
            .ok_or(BufferAllocError::SlotSpaceExhausted)?;
        Ok(SharedBuffer::new_shmem(
            self.assign_serial(),
            format,
            size,
            flags,
            slot,
            byte_len as usize,
            Arc::clone(&self.link),
        ))
    }

    fn assign_serial(&self) -> BufferSerial {
        BufferSerial(self.next_serial.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for BufferAllocator {
    fn default() -> Self {
        Self::new()
    }
}
