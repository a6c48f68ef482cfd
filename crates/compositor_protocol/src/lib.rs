use std::fmt;

use smallvec::SmallVec;

slotmap::new_key_type! {
    pub struct CompositableHandle;

    pub struct LayerHandle;
}

/// Producer-side identity of an async image container. Zero is reserved by
/// the bridge endpoint and never names a live container, so APIs carry
/// `Option<AsyncContainerHandle>` instead of a sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncContainerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageSerial(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProducerId(pub u32);

/// Presentation time in microseconds on the producer clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameTimestamp(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncToken(pub u64);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TextureFlags: u32 {
        const NON_PREMULTIPLIED = 1 << 0;
        const ORIGIN_BOTTOM_LEFT = 1 << 1;
        const RECYCLE = 1 << 2;
    }
}

impl Default for TextureFlags {
    fn default() -> Self {
        TextureFlags::empty()
    }
}

bitflags::bitflags! {
    /// Caller hints about the content being published. Reserved for
    /// opaque-content upload shortcuts; the publish contract ignores them
    /// today.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContentFlags: u32 {
        const OPAQUE = 1 << 0;
        const COMPONENT_ALPHA = 1 << 1;
    }
}

impl Default for ContentFlags {
    fn default() -> Self {
        ContentFlags::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    A8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::A8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Tightly packed byte length of one plane in `format`, or `None` if the
    /// product does not fit in `u64`.
    pub fn byte_len(self, format: PixelFormat) -> Option<u64> {
        (self.width as u64)
            .checked_mul(self.height as u64)?
            .checked_mul(format.bytes_per_pixel() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureRect {
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
}

impl PictureRect {
    pub const fn from_size(size: ImageSize) -> Self {
        Self {
            origin_x: 0,
            origin_y: 0,
            width: size.width,
            height: size.height,
        }
    }
}

/// One forwarded frame: a texture reference plus its presentation metadata.
///
/// Generic over the texture reference so the shape is defined once here and
/// instantiated with the in-process buffer handle by the publisher side.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedFrame<Texture> {
    pub texture: Texture,
    pub timestamp: FrameTimestamp,
    pub picture_rect: PictureRect,
    pub frame_id: FrameId,
    pub producer_id: ProducerId,
}

/// Inline capacity matches the common snapshot depth of video producers;
/// longer snapshots spill to the heap.
pub type FrameBatch<Texture> = SmallVec<[TimedFrame<Texture>; 4]>;

/// Instructions a producer-side client issues to the remote compositable
/// host. Ops from one client are applied in issue order (per-client FIFO);
/// no ordering holds across clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOp<Texture> {
    UseTextures {
        compositable: CompositableHandle,
        frames: FrameBatch<Texture>,
    },
    RemoveTexture {
        compositable: CompositableHandle,
        texture: Texture,
    },
    AttachAsyncCompositable {
        container: AsyncContainerHandle,
        layer: LayerHandle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositableKind {
    SingleBuffer,
    Bridge,
    Unknown,
}

/// Compositable-kind tag as it arrives from the compositor handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawCompositableTag(pub u32);

impl RawCompositableTag {
    pub const UNKNOWN: Self = Self(0);
    pub const SINGLE_BUFFER: Self = Self(1);
    pub const BRIDGE: Self = Self(2);
}

impl CompositableKind {
    /// Decode a handshake tag. Tags outside the closed set mean the producer
    /// and compositor were built against different compositable
    /// vocabularies; that skew cannot be reconciled at runtime.
    pub fn from_raw(tag: RawCompositableTag) -> Self {
        match tag {
            RawCompositableTag::UNKNOWN => CompositableKind::Unknown,
            RawCompositableTag::SINGLE_BUFFER => CompositableKind::SingleBuffer,
            RawCompositableTag::BRIDGE => CompositableKind::Bridge,
            RawCompositableTag(raw) => {
                panic!("unhandled compositable tag {raw}: producer/compositor version skew")
            }
        }
    }

    pub const fn to_raw(self) -> RawCompositableTag {
        match self {
            CompositableKind::Unknown => RawCompositableTag::UNKNOWN,
            CompositableKind::SingleBuffer => RawCompositableTag::SINGLE_BUFFER,
            CompositableKind::Bridge => RawCompositableTag::BRIDGE,
        }
    }
}

impl fmt::Display for CompositableKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositableKind::SingleBuffer => write!(formatter, "single-buffer"),
            CompositableKind::Bridge => write!(formatter, "bridge"),
            CompositableKind::Unknown => write!(formatter, "unknown"),
        }
    }
}
