use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use buffers::{LinkId, SharedBuffer};
use compositor_protocol::{
    AsyncContainerHandle, FrameId, FrameTimestamp, ImageSerial, ImageSize, PictureRect,
    PixelFormat, ProducerId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelReadError {
    SizeMismatch,
    SourceInvalid,
}

impl fmt::Display for PixelReadError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelReadError::SizeMismatch => {
                write!(formatter, "destination length does not match the image plane")
            }
            PixelReadError::SourceInvalid => {
                write!(formatter, "source image was invalidated by its producer")
            }
        }
    }
}

impl std::error::Error for PixelReadError {}

/// One producer-owned frame object: a decoded video frame, a canvas
/// surface, a camera capture.
pub trait SourceImage: Send + Sync {
    fn serial(&self) -> ImageSerial;

    /// False once the producer has torn the frame down; invalid frames are
    /// filtered out of every publish.
    fn is_valid(&self) -> bool;

    fn format(&self) -> PixelFormat;

    fn size(&self) -> ImageSize;

    fn picture_rect(&self) -> PictureRect;

    /// A shared buffer this image already owns for the given forwarder
    /// link, if the producer wrote into one directly.
    fn bound_texture(&self, link: LinkId) -> Option<SharedBuffer> {
        let _ = link;
        None
    }

    /// Convert/copy the image's pixels into `dst` (tightly packed, the
    /// image's own format and size).
    fn read_pixels_into(&self, dst: &mut [u8]) -> Result<(), PixelReadError>;
}

/// Snapshot element: a frame plus the presentation metadata the producer
/// attached when it was made current.
#[derive(Clone)]
pub struct OwnedImage {
    pub image: Arc<dyn SourceImage>,
    pub timestamp: FrameTimestamp,
    pub frame_id: FrameId,
    pub producer_id: ProducerId,
}

impl fmt::Debug for OwnedImage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OwnedImage")
            .field("serial", &self.image.serial())
            .field("timestamp", &self.timestamp)
            .field("frame_id", &self.frame_id)
            .field("producer_id", &self.producer_id)
            .finish()
    }
}

/// Ordered, deduplicated view of the producer's current frames plus the
/// generation stamp that versioned it.
#[derive(Debug, Clone)]
pub struct ImagesSnapshot {
    pub images: Vec<OwnedImage>,
    pub generation: u64,
}

pub trait FrameSource: Send + Sync {
    fn current_images(&self) -> ImagesSnapshot;

    fn async_container_handle(&self) -> Option<AsyncContainerHandle>;
}

/// Concrete producer-side container of current images.
///
/// `set_current_images` and `clear_all_images` may race with a publisher
/// snapshotting from another thread; the loser simply observes the newer
/// generation on its next pass. The generation counter never decreases.
pub struct ImageContainer {
    producer_id: ProducerId,
    state: Mutex<ContainerState>,
}

struct ContainerState {
    images: Vec<OwnedImage>,
    generation: u64,
    next_frame_id: u64,
    async_handle: Option<AsyncContainerHandle>,
}

impl ImageContainer {
    pub fn new(producer_id: ProducerId) -> Self {
        Self {
            producer_id,
            state: Mutex::new(ContainerState {
                images: Vec::new(),
                generation: 0,
                next_frame_id: 1,
                async_handle: None,
            }),
        }
    }

    pub fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    /// Replace the current image list. Frames are kept in call order,
    /// deduplicated by image serial (first occurrence wins), stamped with
    /// fresh frame ids, and the generation advances.
    pub fn set_current_images(&self, frames: Vec<(Arc<dyn SourceImage>, FrameTimestamp)>) {
        let mut state = self.lock_state();
        let mut seen: HashSet<ImageSerial> = HashSet::new();
        let producer_id = self.producer_id;
        state.images.clear();
        for (image, timestamp) in frames {
            if !seen.insert(image.serial()) {
                continue;
            }
            let frame_id = FrameId(state.next_frame_id);
            state.next_frame_id += 1;
            state.images.push(OwnedImage {
                image,
                timestamp,
                frame_id,
                producer_id,
            });
        }
        state.generation += 1;
    }

    /// Drop every current image. Publishers observe an empty snapshot under
    /// a new generation, which is a success path, not an error.
    pub fn clear_all_images(&self) {
        let mut state = self.lock_state();
        state.images.clear();
        state.generation += 1;
    }

    pub fn set_async_container_handle(&self, handle: Option<AsyncContainerHandle>) {
        self.lock_state().async_handle = handle;
    }

    pub fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    fn lock_state(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().expect("image container state lock poisoned")
    }
}

impl FrameSource for ImageContainer {
    fn current_images(&self) -> ImagesSnapshot {
        let state = self.lock_state();
        ImagesSnapshot {
            images: state.images.clone(),
            generation: state.generation,
        }
    }

    fn async_container_handle(&self) -> Option<AsyncContainerHandle> {
        self.lock_state().async_handle
    }
}

static NEXT_IMAGE_SERIAL: AtomicU64 = AtomicU64::new(1);

/// CPU-pixel frame used by producers without native surfaces.
pub struct MemoryImage {
    serial: ImageSerial,
    format: PixelFormat,
    size: ImageSize,
    picture_rect: PictureRect,
    pixels: Vec<u8>,
    valid: AtomicBool,
    bound: Mutex<HashMap<LinkId, SharedBuffer>>,
}

impl MemoryImage {
    pub fn new(format: PixelFormat, size: ImageSize, pixels: Vec<u8>) -> Self {
        let expected = size
            .byte_len(format)
            .unwrap_or_else(|| panic!("memory image byte length overflow"));
        assert_eq!(
            pixels.len() as u64,
            expected,
            "memory image pixel length must match a packed {}x{} plane",
            size.width,
            size.height
        );
        Self {
            serial: ImageSerial(NEXT_IMAGE_SERIAL.fetch_add(1, Ordering::Relaxed)),
            format,
            size,
            picture_rect: PictureRect::from_size(size),
            pixels,
            valid: AtomicBool::new(true),
            bound: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_picture_rect(mut self, picture_rect: PictureRect) -> Self {
        self.picture_rect = picture_rect;
        self
    }

    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Install a buffer this image owns for one forwarder link; the
    /// publisher picks it up instead of allocating and copying.
    pub fn bind_texture(&self, link: LinkId, buffer: SharedBuffer) {
        self.bound
            .lock()
            .expect("memory image binding lock poisoned")
            .insert(link, buffer);
    }
}

impl SourceImage for MemoryImage {
    fn serial(&self) -> ImageSerial {
        self.serial
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn size(&self) -> ImageSize {
        self.size
    }

    fn picture_rect(&self) -> PictureRect {
        self.picture_rect
    }

    fn bound_texture(&self, link: LinkId) -> Option<SharedBuffer> {
        self.bound
            .lock()
            .expect("memory image binding lock poisoned")
            .get(&link)
            .cloned()
    }

    fn read_pixels_into(&self, dst: &mut [u8]) -> Result<(), PixelReadError> {
        if !self.is_valid() {
            return Err(PixelReadError::SourceInvalid);
        }
        if dst.len() != self.pixels.len() {
            return Err(PixelReadError::SizeMismatch);
        }
        dst.copy_from_slice(&self.pixels);
        Ok(())
    }
}
