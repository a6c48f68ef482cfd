use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use compositor_protocol::{ImageSize, PixelFormat, SyncToken, TextureFlags};

use crate::arena::SlotIndex;
use crate::link::{GpuHandleToken, LinkId, RemoteAllocatorLink};
use crate::{BufferLockError, BufferSerial};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Shmem,
    GpuNative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Read,
    Write,
}

/// Serializable remote reference to a shared buffer; the payload shape the
/// forwarding channel carries for the compositor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub serial: BufferSerial,
    pub format: PixelFormat,
    pub size: ImageSize,
    pub link: LinkId,
    pub backing: BackingDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingDescriptor {
    Shmem { slot: SlotIndex, byte_len: u64 },
    GpuHandle { token: GpuHandleToken },
}

#[derive(Debug)]
enum Backing {
    Shmem {
        slot: SlotIndex,
        byte_len: usize,
        bytes: Mutex<Box<[u8]>>,
    },
    GpuNative {
        token: GpuHandleToken,
    },
}

#[derive(Debug, Clone, Copy)]
enum LockState {
    Unlocked,
    ReadLocked { readers: u32 },
    WriteLocked,
}

#[derive(Debug, Clone, Copy, Default)]
struct RemoteFlags {
    forwarded: bool,
    removed: bool,
    sync: Option<SyncToken>,
}

/// Reference-counted handle to one block of memory shareable with the
/// remote compositor.
///
/// Clones share the same underlying buffer; the backing slot is returned to
/// the arena when the last clone drops, gated on the remote side no longer
/// referencing it (never forwarded, remove applied, or channel closed).
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    inner: Arc<BufferInner>,
}

#[derive(Debug)]
struct BufferInner {
    serial: BufferSerial,
    format: PixelFormat,
    size: ImageSize,
    flags: TextureFlags,
    backing: Backing,
    link: Arc<RemoteAllocatorLink>,
    lock: Mutex<LockState>,
    remote: Mutex<RemoteFlags>,
}

impl SharedBuffer {
    pub(crate) fn new_shmem(
        serial: BufferSerial,
        format: PixelFormat,
        size: ImageSize,
        flags: TextureFlags,
        slot: SlotIndex,
        byte_len: usize,
        link: Arc<RemoteAllocatorLink>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                serial,
                format,
                size,
                flags,
                backing: Backing::Shmem {
                    slot,
                    byte_len,
                    bytes: Mutex::new(vec![0u8; byte_len].into_boxed_slice()),
                },
                link,
                lock: Mutex::new(LockState::Unlocked),
                remote: Mutex::new(RemoteFlags::default()),
            }),
        }
    }

    pub(crate) fn new_gpu_native(
        serial: BufferSerial,
        format: PixelFormat,
        size: ImageSize,
        flags: TextureFlags,
        token: GpuHandleToken,
        link: Arc<RemoteAllocatorLink>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                serial,
                format,
                size,
                flags,
                backing: Backing::GpuNative { token },
                link,
                lock: Mutex::new(LockState::Unlocked),
                remote: Mutex::new(RemoteFlags::default()),
            }),
        }
    }

    pub fn serial(&self) -> BufferSerial {
        self.inner.serial
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    pub fn size(&self) -> ImageSize {
        self.inner.size
    }

    pub fn texture_flags(&self) -> TextureFlags {
        self.inner.flags
    }

    pub fn backing_kind(&self) -> BackingKind {
        match self.inner.backing {
            Backing::Shmem { .. } => BackingKind::Shmem,
            Backing::GpuNative { .. } => BackingKind::GpuNative,
        }
    }

    pub fn link_id(&self) -> LinkId {
        self.inner.link.id()
    }

    pub fn is_channel_open(&self) -> bool {
        self.inner.link.is_open()
    }

    /// Identity comparison: do two handles name the same buffer?
    pub fn ptr_eq(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn descriptor(&self) -> BufferDescriptor {
        let backing = match &self.inner.backing {
            Backing::Shmem { slot, byte_len, .. } => BackingDescriptor::Shmem {
                slot: *slot,
                byte_len: *byte_len as u64,
            },
            Backing::GpuNative { token } => BackingDescriptor::GpuHandle { token: *token },
        };
        BufferDescriptor {
            serial: self.inner.serial,
            format: self.inner.format,
            size: self.inner.size,
            link: self.inner.link.id(),
            backing,
        }
    }

    pub fn lock_mode(&self) -> LockMode {
        match *self.inner.lock.lock().expect("buffer lock state poisoned") {
            LockState::Unlocked => LockMode::Unlocked,
            LockState::ReadLocked { .. } => LockMode::Read,
            LockState::WriteLocked => LockMode::Write,
        }
    }

    /// Take the exclusive write lock. The guard restores the unlocked state
    /// on every exit path, including early returns from a failed pixel
    /// conversion.
    pub fn write_lock(&self) -> Result<WriteLockGuard<'_>, BufferLockError> {
        let Backing::Shmem { bytes, .. } = &self.inner.backing else {
            return Err(BufferLockError::NoCpuMapping);
        };
        {
            let mut state = self.inner.lock.lock().expect("buffer lock state poisoned");
            match *state {
                LockState::Unlocked => *state = LockState::WriteLocked,
                LockState::ReadLocked { .. } | LockState::WriteLocked => {
                    return Err(BufferLockError::AlreadyLocked);
                }
            }
        }
        let bytes = bytes.lock().expect("buffer mapping lock poisoned");
        Ok(WriteLockGuard {
            inner: &self.inner,
            bytes,
        })
    }

    /// Take a shared read lock. Readers coexist with each other but not with
    /// the write lock.
    pub fn read_lock(&self) -> Result<ReadLockGuard<'_>, BufferLockError> {
        let mut state = self.inner.lock.lock().expect("buffer lock state poisoned");
        match *state {
            LockState::Unlocked => *state = LockState::ReadLocked { readers: 1 },
            LockState::ReadLocked { readers } => {
                *state = LockState::ReadLocked {
                    readers: readers
                        .checked_add(1)
                        .unwrap_or_else(|| panic!("buffer reader count overflow")),
                }
            }
            LockState::WriteLocked => return Err(BufferLockError::AlreadyLocked),
        }
        drop(state);
        Ok(ReadLockGuard { inner: &self.inner })
    }

    /// Record that this buffer has been handed to the compositor; from here
    /// on its slot must survive until the remove op is applied.
    pub fn mark_forwarded(&self) {
        self.remote_flags().forwarded = true;
    }

    pub fn is_forwarded(&self) -> bool {
        self.remote_flags().forwarded
    }

    /// Record that the compositor applied the remove op for this buffer.
    pub fn mark_removed_from_compositable(&self) {
        self.remote_flags().removed = true;
    }

    pub fn attach_sync_token(&self, token: SyncToken) {
        self.remote_flags().sync = Some(token);
    }

    pub fn sync_token(&self) -> Option<SyncToken> {
        self.remote_flags().sync
    }

    pub(crate) fn shmem_slot(&self) -> Option<SlotIndex> {
        match &self.inner.backing {
            Backing::Shmem { slot, .. } => Some(*slot),
            Backing::GpuNative { .. } => None,
        }
    }

    fn remote_flags(&self) -> MutexGuard<'_, RemoteFlags> {
        self.inner
            .remote
            .lock()
            .expect("buffer remote flags lock poisoned")
    }
}

impl PartialEq for SharedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for SharedBuffer {}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let Backing::Shmem { slot, .. } = &self.backing else {
            return;
        };
        let flags = match self.remote.get_mut() {
            Ok(flags) => *flags,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if !flags.forwarded || flags.removed || !self.link.is_open() {
            self.link.arena().release_slot(*slot);
        } else {
            self.link.arena().park_slot(*slot);
        }
    }
}

#[derive(Debug)]
pub struct WriteLockGuard<'a> {
    inner: &'a BufferInner,
    bytes: MutexGuard<'a, Box<[u8]>>,
}

impl WriteLockGuard<'_> {
    /// View the mapping as typed pixels. `None` when the byte length is not
    /// a whole number of `P`.
    pub fn pixels_mut<P: bytemuck::Pod>(&mut self) -> Option<&mut [P]> {
        bytemuck::try_cast_slice_mut(&mut self.bytes[..]).ok()
    }
}

impl Deref for WriteLockGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for WriteLockGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        *self.inner.lock.lock().expect("buffer lock state poisoned") = LockState::Unlocked;
    }
}

#[derive(Debug)]
pub struct ReadLockGuard<'a> {
    inner: &'a BufferInner,
}

impl ReadLockGuard<'_> {
    /// Copy out up to `dst.len()` bytes of the mapping. Fails for backings
    /// without a CPU mapping.
    pub fn copy_to(&self, dst: &mut [u8]) -> Result<usize, BufferLockError> {
        let Backing::Shmem { bytes, .. } = &self.inner.backing else {
            return Err(BufferLockError::NoCpuMapping);
        };
        let bytes = bytes.lock().expect("buffer mapping lock poisoned");
        let count = dst.len().min(bytes.len());
        dst[..count].copy_from_slice(&bytes[..count]);
        Ok(count)
    }
}

impl Drop for ReadLockGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock.lock().expect("buffer lock state poisoned");
        match *state {
            LockState::ReadLocked { readers: 1 } => *state = LockState::Unlocked,
            LockState::ReadLocked { readers } => {
                *state = LockState::ReadLocked {
                    readers: readers - 1,
                }
            }
            LockState::Unlocked | LockState::WriteLocked => {
                panic!("read lock guard dropped without an outstanding read lock")
            }
        }
    }
}
