use std::collections::{HashMap, HashSet};

use buffers::SharedBuffer;
use compositor_protocol::{
    CompositableHandle, ContentFlags, FrameBatch, ImageSerial, TextureFlags, TimedFrame,
};
use image_source::FrameSource;

use crate::{CompositorForwarder, UpdateImageError, texture_for_image};

/// Publishes per-frame textures to one remote compositable.
///
/// The working set maps each current frame identity to the buffer carrying
/// it. A publish cycle diffs the producer's snapshot against that set,
/// recycles buffers for frames that survived, allocates for frames that are
/// new, and forwards the additions strictly before the removals so the
/// compositor never drops to an empty frame while a replacement is in
/// flight.
pub struct SingleBufferPublisher {
    forwarder: Box<dyn CompositorForwarder>,
    compositable: CompositableHandle,
    flags: TextureFlags,
    bindings: HashMap<ImageSerial, SharedBuffer>,
    primary_serial: Option<ImageSerial>,
    last_generation: Option<u64>,
    detached: bool,
}

impl SingleBufferPublisher {
    pub fn new(
        forwarder: Box<dyn CompositorForwarder>,
        compositable: CompositableHandle,
        flags: TextureFlags,
    ) -> Self {
        Self {
            forwarder,
            compositable,
            flags,
            bindings: HashMap::new(),
            primary_serial: None,
            last_generation: None,
            detached: false,
        }
    }

    pub fn compositable(&self) -> CompositableHandle {
        self.compositable
    }

    pub fn texture_flags(&self) -> TextureFlags {
        self.flags
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Number of frame bindings currently held.
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Publish the producer's current snapshot. Either the whole snapshot is
    /// forwarded and the working set swapped, or the call fails and the
    /// working set is exactly what it was before.
    pub fn update_image(
        &mut self,
        source: &dyn FrameSource,
        _content_flags: ContentFlags,
    ) -> Result<(), UpdateImageError> {
        if self.detached {
            return Err(UpdateImageError::Detached);
        }

        let snapshot = source.current_images();
        if self.last_generation == Some(snapshot.generation) {
            // Producer has not published since the last cycle.
            return Ok(());
        }

        let mut images = snapshot.images;
        // A frame can be torn down between snapshot capture and this cycle.
        images.retain(|owned| owned.image.is_valid());

        if images.is_empty() {
            // A producer clear raced the snapshot, or every frame was
            // invalid. Empty is a success: recreating the publisher would
            // not help the caller.
            for (_, buffer) in self.bindings.drain() {
                self.forwarder.remove_texture(self.compositable, buffer);
            }
            self.primary_serial = None;
            self.last_generation = Some(snapshot.generation);
            return Ok(());
        }

        let link_id = self.forwarder.allocator().link().id();
        let mut new_bindings: HashMap<ImageSerial, SharedBuffer> =
            HashMap::with_capacity(images.len());
        let mut carried: HashSet<ImageSerial> = HashSet::new();
        let mut frames: FrameBatch<SharedBuffer> = FrameBatch::new();
        let mut primary_serial = None;

        for owned in &images {
            let serial = owned.image.serial();
            let mut texture = owned.image.bound_texture(link_id);

            if let Some(existing) = self.bindings.get(&serial) {
                match &texture {
                    Some(bound) => debug_assert!(
                        bound.ptr_eq(existing),
                        "image-owned texture diverged from its standing binding"
                    ),
                    None => texture = Some(existing.clone()),
                }
                carried.insert(serial);
            }

            let texture = match texture {
                Some(texture) => texture,
                None => texture_for_image(
                    owned.image.as_ref(),
                    self.forwarder.allocator(),
                    self.flags,
                )?,
            };

            // The compositor process can restart between producing a frame
            // and publishing it. The frame is dropped without error; the
            // producer re-surfaces it under the next generation.
            if !texture.is_channel_open() {
                continue;
            }

            debug_assert!(
                texture.texture_flags().contains(self.flags),
                "forwarded texture must carry at least the publisher's flags"
            );
            if !self.forwarder.register_texture(&texture) {
                return Err(UpdateImageError::RegisterTextureFailed);
            }

            if primary_serial.is_none() {
                primary_serial = Some(serial);
            }
            frames.push(TimedFrame {
                texture: texture.clone(),
                timestamp: owned.timestamp,
                picture_rect: owned.image.picture_rect(),
                frame_id: owned.frame_id,
                producer_id: owned.producer_id,
            });
            new_bindings.insert(serial, texture);
        }

        // Commit point: nothing below fails. Additions go out before
        // removals, always.
        let sync_token = self.forwarder.sync_token();
        for frame in &frames {
            frame.texture.mark_forwarded();
            if let Some(token) = sync_token {
                frame.texture.attach_sync_token(token);
            }
        }
        self.forwarder.use_textures(self.compositable, frames);

        for (serial, buffer) in self.bindings.drain() {
            if !carried.contains(&serial) {
                self.forwarder.remove_texture(self.compositable, buffer);
            }
        }

        self.bindings = new_bindings;
        self.primary_serial = primary_serial;
        self.last_generation = Some(snapshot.generation);
        Ok(())
    }

    /// The compositable itself is being torn down: drop every binding
    /// without per-texture removes (they would be redundant) and refuse
    /// further publishes.
    pub fn on_detach(&mut self) {
        self.bindings.clear();
        self.primary_serial = None;
        self.detached = true;
    }

    /// Forcibly detach every forwarded buffer; used on teardown while the
    /// compositable is still alive.
    pub fn flush_all_images(&mut self) {
        for (_, buffer) in self.bindings.drain() {
            self.forwarder.remove_texture(self.compositable, buffer);
        }
        self.primary_serial = None;
    }

    /// The buffer carrying the first frame of the last published snapshot.
    pub fn forwarded_texture(&self) -> Option<SharedBuffer> {
        self.bindings.get(&self.primary_serial?).cloned()
    }
}
