use std::fmt;

use buffers::{BufferAllocError, BufferAllocator, BufferLockError, BufferUsage, SharedBuffer};
use compositor_protocol::{
    AsyncContainerHandle, CompositableHandle, CompositableKind, ContentFlags, FrameBatch,
    LayerHandle, RawCompositableTag, SyncToken, TextureFlags,
};
use image_source::{FrameSource, PixelReadError, SourceImage};

mod bridge;
mod single_buffer;
#[cfg(test)]
mod tests;

pub use bridge::BridgePublisher;
pub use single_buffer::SingleBufferPublisher;

/// Producer-side view of the remote compositable host.
///
/// Implementations must apply ops from one publisher in issue order
/// (per-client FIFO); nothing is guaranteed across publishers. All calls are
/// fire-and-forget: the publisher never blocks on compositor acknowledgement.
pub trait CompositorForwarder: Send {
    /// The allocator feeding this forwarder's remote channel.
    fn allocator(&self) -> &BufferAllocator;

    /// Announce a buffer to the compositable ahead of its first use.
    /// Returning false aborts the publish cycle that requested it.
    fn register_texture(&mut self, buffer: &SharedBuffer) -> bool;

    /// Batched "display these frames" instruction.
    fn use_textures(&mut self, compositable: CompositableHandle, frames: FrameBatch<SharedBuffer>);

    /// Detach one buffer from the compositable.
    fn remove_texture(&mut self, compositable: CompositableHandle, texture: SharedBuffer);

    /// Bind an async container to a layer; frame delivery then happens on
    /// the producer's own bridge channel.
    fn attach_async_compositable(&mut self, container: AsyncContainerHandle, layer: LayerHandle);

    /// Optional cross-device synchronization token to attach to buffers
    /// after their pixels are written.
    fn sync_token(&mut self) -> Option<SyncToken> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureForImageError {
    Alloc(BufferAllocError),
    Lock(BufferLockError),
    PixelRead(PixelReadError),
}

impl From<BufferAllocError> for TextureForImageError {
    fn from(value: BufferAllocError) -> Self {
        Self::Alloc(value)
    }
}

impl From<BufferLockError> for TextureForImageError {
    fn from(value: BufferLockError) -> Self {
        Self::Lock(value)
    }
}

impl From<PixelReadError> for TextureForImageError {
    fn from(value: PixelReadError) -> Self {
        Self::PixelRead(value)
    }
}

impl fmt::Display for TextureForImageError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureForImageError::Alloc(error) => {
                write!(formatter, "buffer allocation failed: {error}")
            }
            TextureForImageError::Lock(error) => {
                write!(formatter, "buffer write lock failed: {error}")
            }
            TextureForImageError::PixelRead(error) => {
                write!(formatter, "image pixel conversion failed: {error}")
            }
        }
    }
}

impl std::error::Error for TextureForImageError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateImageError {
    /// The publisher was detached from its compositable and is terminal.
    Detached,
    /// Bridge variant has no layer to attach the container to yet.
    LayerNotAttached,
    /// No buffer could be obtained for a frame; the whole cycle aborted and
    /// the working set is untouched.
    TextureAcquisition(TextureForImageError),
    /// The forwarder refused a texture announcement; cycle aborted.
    RegisterTextureFailed,
}

impl From<TextureForImageError> for UpdateImageError {
    fn from(value: TextureForImageError) -> Self {
        Self::TextureAcquisition(value)
    }
}

impl fmt::Display for UpdateImageError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateImageError::Detached => {
                write!(formatter, "publisher is detached from its compositable")
            }
            UpdateImageError::LayerNotAttached => {
                write!(formatter, "bridge publisher has no layer attached")
            }
            UpdateImageError::TextureAcquisition(error) => {
                write!(formatter, "publish cycle aborted: {error}")
            }
            UpdateImageError::RegisterTextureFailed => {
                write!(formatter, "forwarder refused the texture announcement")
            }
        }
    }
}

impl std::error::Error for UpdateImageError {}

/// Slow path: obtain a CPU-mappable buffer for an image that owns no
/// texture, and copy its pixels in under a scoped write lock. The lock is
/// released on every exit path, including conversion failure.
pub fn texture_for_image(
    image: &dyn SourceImage,
    allocator: &BufferAllocator,
    flags: TextureFlags,
) -> Result<SharedBuffer, TextureForImageError> {
    let buffer = allocator.allocate_flagged(
        image.format(),
        image.size(),
        BufferUsage::CpuPixels,
        flags,
    )?;
    {
        let mut guard = buffer.write_lock()?;
        image.read_pixels_into(&mut guard)?;
    }
    Ok(buffer)
}

/// The image-publishing client, polymorphic over its compositable kind.
pub enum ImagePublisher {
    SingleBuffer(SingleBufferPublisher),
    Bridge(BridgePublisher),
}

impl ImagePublisher {
    pub fn kind(&self) -> CompositableKind {
        match self {
            ImagePublisher::SingleBuffer(_) => CompositableKind::SingleBuffer,
            ImagePublisher::Bridge(_) => CompositableKind::Bridge,
        }
    }

    pub fn update_image(
        &mut self,
        source: &dyn FrameSource,
        content_flags: ContentFlags,
    ) -> Result<(), UpdateImageError> {
        match self {
            ImagePublisher::SingleBuffer(publisher) => {
                publisher.update_image(source, content_flags)
            }
            ImagePublisher::Bridge(publisher) => publisher.update_image(source, content_flags),
        }
    }

    pub fn on_detach(&mut self) {
        match self {
            ImagePublisher::SingleBuffer(publisher) => publisher.on_detach(),
            ImagePublisher::Bridge(publisher) => publisher.on_detach(),
        }
    }

    pub fn flush_all_images(&mut self) {
        match self {
            ImagePublisher::SingleBuffer(publisher) => publisher.flush_all_images(),
            ImagePublisher::Bridge(publisher) => publisher.flush_all_images(),
        }
    }

    pub fn forwarded_texture(&self) -> Option<SharedBuffer> {
        match self {
            ImagePublisher::SingleBuffer(publisher) => publisher.forwarded_texture(),
            ImagePublisher::Bridge(publisher) => publisher.forwarded_texture(),
        }
    }
}

/// Build the publisher variant for a compositable tag from the compositor
/// handshake.
///
/// `Unknown` names a compositable this client cannot drive; the caller keeps
/// its previous state. A tag outside the closed set panics in
/// `CompositableKind::from_raw`, since producer/compositor version skew
/// cannot be reconciled at runtime.
pub fn create_publisher(
    tag: RawCompositableTag,
    forwarder: Box<dyn CompositorForwarder>,
    compositable: CompositableHandle,
    flags: TextureFlags,
) -> Option<ImagePublisher> {
    match CompositableKind::from_raw(tag) {
        CompositableKind::SingleBuffer => Some(ImagePublisher::SingleBuffer(
            SingleBufferPublisher::new(forwarder, compositable, flags),
        )),
        CompositableKind::Bridge => {
            Some(ImagePublisher::Bridge(BridgePublisher::new(forwarder)))
        }
        CompositableKind::Unknown => None,
    }
}
