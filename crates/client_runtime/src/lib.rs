use std::sync::Arc;

use buffers::{
    AllocatorConfig, BackingDescriptor, BufferAllocator, RemoteAllocatorLink, SharedBuffer,
};
use compositor_protocol::{
    AsyncContainerHandle, CompositableHandle, ForwardOp, FrameBatch, LayerHandle, SyncToken,
};
use publisher::CompositorForwarder;
use rtrb::{Consumer, Producer, PushError, RingBuffer};

mod bridge;
mod host;
mod update_ring;

pub use bridge::PublisherThreadBridge;
pub use host::CompositableTable;
pub use update_ring::{
    ProducerUpdateHandle, PublisherUpdateQueue, UpdateRequest, create_update_ring,
};

/// Build the paired endpoints of one client's forwarding channel: the
/// producer-side forwarder and the compositor-side inbox.
///
/// The SPSC ring is the transport-level realization of the per-client FIFO
/// guarantee: ops pushed by this forwarder are popped by this inbox in
/// exactly the order they were issued.
pub fn create_forwarder_link(
    op_capacity: usize,
    allocator_config: AllocatorConfig,
    sync_token: Option<SyncToken>,
) -> (ChannelForwarder, CompositorInbox) {
    assert!(
        op_capacity > 0,
        "forwarder op capacity must be greater than zero"
    );
    let allocator = BufferAllocator::with_config(allocator_config);
    let link = Arc::clone(allocator.link());
    let (op_sender, op_receiver) = RingBuffer::new(op_capacity);
    (
        ChannelForwarder {
            allocator,
            ops: op_sender,
            sync_token,
        },
        CompositorInbox {
            ops: op_receiver,
            link,
        },
    )
}

/// `CompositorForwarder` over an SPSC op ring. Owned by exactly one
/// publisher; the consuming end lives with the compositor stand-in.
pub struct ChannelForwarder {
    allocator: BufferAllocator,
    ops: Producer<ForwardOp<SharedBuffer>>,
    sync_token: Option<SyncToken>,
}

impl ChannelForwarder {
    fn push_op(&mut self, op: ForwardOp<SharedBuffer>) {
        // Fire-and-forget: with the remote gone the op has nowhere to land,
        // and publishers observe the closure through the allocator link.
        if !self.allocator.link().is_open() {
            return;
        }
        let mut pending_op = op;
        loop {
            match self.ops.push(pending_op) {
                Ok(()) => return,
                Err(PushError::Full(returned_op)) => {
                    pending_op = returned_op;
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl CompositorForwarder for ChannelForwarder {
    fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    fn register_texture(&mut self, buffer: &SharedBuffer) -> bool {
        buffer.is_channel_open()
    }

    fn use_textures(&mut self, compositable: CompositableHandle, frames: FrameBatch<SharedBuffer>) {
        self.push_op(ForwardOp::UseTextures {
            compositable,
            frames,
        });
    }

    fn remove_texture(&mut self, compositable: CompositableHandle, texture: SharedBuffer) {
        self.push_op(ForwardOp::RemoveTexture {
            compositable,
            texture,
        });
    }

    fn attach_async_compositable(&mut self, container: AsyncContainerHandle, layer: LayerHandle) {
        self.push_op(ForwardOp::AttachAsyncCompositable { container, layer });
    }

    fn sync_token(&mut self) -> Option<SyncToken> {
        self.sync_token
    }
}

/// Compositor-side end of the forwarding channel: pops ops in FIFO order
/// and applies them to the compositable table, reclaiming arena slots the
/// moment a remove lands.
pub struct CompositorInbox {
    ops: Consumer<ForwardOp<SharedBuffer>>,
    link: Arc<RemoteAllocatorLink>,
}

impl CompositorInbox {
    pub fn link(&self) -> &Arc<RemoteAllocatorLink> {
        &self.link
    }

    pub fn pending_ops(&self) -> usize {
        self.ops.slots()
    }

    /// Apply every queued op, in order. Returns how many were applied.
    pub fn drain_into(&mut self, table: &mut CompositableTable) -> usize {
        let mut applied = 0;
        while let Ok(op) = self.ops.pop() {
            if let ForwardOp::RemoveTexture { texture, .. } = &op {
                texture.mark_removed_from_compositable();
                if let BackingDescriptor::Shmem { slot, .. } = texture.descriptor().backing {
                    // No-op unless the producer side already dropped the
                    // buffer and parked its slot.
                    self.link.arena().reclaim_slot(slot);
                }
            }
            table.apply(op);
            applied += 1;
        }
        applied
    }
}
