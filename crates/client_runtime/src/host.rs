use buffers::{BufferSerial, SharedBuffer};
use compositor_protocol::{
    AsyncContainerHandle, CompositableHandle, ForwardOp, LayerHandle, TimedFrame,
};
use slotmap::SlotMap;

/// In-process stand-in for the remote compositable host: the table of
/// compositables and layers that forwarding ops mutate. Integration tests
/// (and headless runs) drain the inbox into one of these.
pub struct CompositableTable {
    compositables: SlotMap<CompositableHandle, CompositableState>,
    layers: SlotMap<LayerHandle, LayerState>,
}

#[derive(Default)]
struct CompositableState {
    frames: Vec<TimedFrame<SharedBuffer>>,
}

#[derive(Default)]
struct LayerState {
    attached_container: Option<AsyncContainerHandle>,
}

impl CompositableTable {
    pub fn new() -> Self {
        Self {
            compositables: SlotMap::with_key(),
            layers: SlotMap::with_key(),
        }
    }

    pub fn create_compositable(&mut self) -> CompositableHandle {
        self.compositables.insert(CompositableState::default())
    }

    /// Tear one compositable down, dropping its frame references.
    pub fn release_compositable(&mut self, compositable: CompositableHandle) {
        self.compositables.remove(compositable);
    }

    pub fn create_layer(&mut self) -> LayerHandle {
        self.layers.insert(LayerState::default())
    }

    pub fn attached_container(&self, layer: LayerHandle) -> Option<AsyncContainerHandle> {
        self.layers.get(layer)?.attached_container
    }

    /// Serials of the buffers currently displayed by `compositable`, in
    /// presentation order.
    pub fn displayed_serials(&self, compositable: CompositableHandle) -> Vec<BufferSerial> {
        self.compositables
            .get(compositable)
            .map(|state| {
                state
                    .frames
                    .iter()
                    .map(|frame| frame.texture.serial())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply one forwarding op. Ops naming a compositable or layer that was
    /// already torn down are dropped; the producer side cannot observe the
    /// teardown before its in-flight ops land.
    pub fn apply(&mut self, op: ForwardOp<SharedBuffer>) {
        match op {
            ForwardOp::UseTextures {
                compositable,
                frames,
            } => {
                if let Some(state) = self.compositables.get_mut(compositable) {
                    state.frames = frames.into_vec();
                }
            }
            ForwardOp::RemoveTexture {
                compositable,
                texture,
            } => {
                if let Some(state) = self.compositables.get_mut(compositable) {
                    state.frames.retain(|frame| !frame.texture.ptr_eq(&texture));
                }
            }
            ForwardOp::AttachAsyncCompositable { container, layer } => {
                if let Some(state) = self.layers.get_mut(layer) {
                    state.attached_container = Some(container);
                }
            }
        }
    }
}

impl Default for CompositableTable {
    fn default() -> Self {
        Self::new()
    }
}
