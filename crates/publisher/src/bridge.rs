use buffers::SharedBuffer;
use compositor_protocol::{AsyncContainerHandle, ContentFlags, LayerHandle};
use image_source::FrameSource;

use crate::{CompositorForwarder, UpdateImageError};

/// Degenerate publisher for producers that deliver frames to the compositor
/// through their own bridge channel: publishing here only binds the
/// producer's async container to this client's layer, by handle identity.
pub struct BridgePublisher {
    forwarder: Box<dyn CompositorForwarder>,
    layer: Option<LayerHandle>,
    last_container: Option<AsyncContainerHandle>,
    detached: bool,
}

impl BridgePublisher {
    pub fn new(forwarder: Box<dyn CompositorForwarder>) -> Self {
        Self {
            forwarder,
            layer: None,
            last_container: None,
            detached: false,
        }
    }

    /// The owning layer must attach itself before the first publish.
    pub fn attach_layer(&mut self, layer: LayerHandle) {
        self.layer = Some(layer);
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn update_image(
        &mut self,
        source: &dyn FrameSource,
        _content_flags: ContentFlags,
    ) -> Result<(), UpdateImageError> {
        if self.detached {
            return Err(UpdateImageError::Detached);
        }
        let Some(layer) = self.layer else {
            return Err(UpdateImageError::LayerNotAttached);
        };

        let container = source.async_container_handle();
        if container == self.last_container {
            return Ok(());
        }
        self.last_container = container;

        // No container yet means the producer's bridge endpoint is not up;
        // there is nothing to attach and nothing to recreate.
        let Some(container) = container else {
            return Ok(());
        };

        self.forwarder.attach_async_compositable(container, layer);
        Ok(())
    }

    pub fn on_detach(&mut self) {
        self.last_container = None;
        self.detached = true;
    }

    /// Bridge clients hold no per-frame buffers.
    pub fn flush_all_images(&mut self) {}

    pub fn forwarded_texture(&self) -> Option<SharedBuffer> {
        None
    }
}
