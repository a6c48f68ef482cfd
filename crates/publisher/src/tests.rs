use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use buffers::{
    AllocatorCapabilities, AllocatorConfig, BufferAllocator, BufferSerial, RemoteAllocatorLink,
    SharedBuffer,
};
use compositor_protocol::{
    AsyncContainerHandle, CompositableHandle, CompositableKind, ContentFlags, FrameBatch,
    FrameTimestamp, ImageSize, LayerHandle, PixelFormat, ProducerId, RawCompositableTag,
    SyncToken, TextureFlags,
};
use image_source::{ImageContainer, MemoryImage, SourceImage};
use slotmap::SlotMap;

use crate::{
    BridgePublisher, CompositorForwarder, SingleBufferPublisher, UpdateImageError,
    create_publisher,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ForwarderCall {
    Register(BufferSerial),
    Use(Vec<BufferSerial>),
    Remove(BufferSerial),
    Attach(AsyncContainerHandle, LayerHandle),
}

struct RecordingForwarder {
    allocator: BufferAllocator,
    calls: Arc<Mutex<Vec<ForwarderCall>>>,
    refuse_register: Arc<AtomicBool>,
    sync: Option<SyncToken>,
}

impl CompositorForwarder for RecordingForwarder {
    fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    fn register_texture(&mut self, buffer: &SharedBuffer) -> bool {
        if self.refuse_register.load(Ordering::Relaxed) {
            return false;
        }
        self.record(ForwarderCall::Register(buffer.serial()));
        true
    }

    fn use_textures(&mut self, _compositable: CompositableHandle, frames: FrameBatch<SharedBuffer>) {
        let serials = frames.iter().map(|frame| frame.texture.serial()).collect();
        self.record(ForwarderCall::Use(serials));
    }

    fn remove_texture(&mut self, _compositable: CompositableHandle, texture: SharedBuffer) {
        self.record(ForwarderCall::Remove(texture.serial()));
    }

    fn attach_async_compositable(
        &mut self,
        container: AsyncContainerHandle,
        layer: LayerHandle,
    ) {
        self.record(ForwarderCall::Attach(container, layer));
    }

    fn sync_token(&mut self) -> Option<SyncToken> {
        self.sync
    }
}

impl RecordingForwarder {
    fn record(&self, call: ForwarderCall) {
        self.calls
            .lock()
            .expect("recorded calls lock should not be poisoned")
            .push(call);
    }
}

struct Harness {
    calls: Arc<Mutex<Vec<ForwarderCall>>>,
    refuse_register: Arc<AtomicBool>,
    link: Arc<RemoteAllocatorLink>,
    compositable: CompositableHandle,
    layer: LayerHandle,
    // Keeps the slotmap minting the handles alive for the test's duration.
    _hosts: SlotMap<CompositableHandle, ()>,
    _layers: SlotMap<LayerHandle, ()>,
}

fn forwarder_with(slot_count: u32, sync: Option<SyncToken>) -> (Box<RecordingForwarder>, Harness) {
    let allocator = BufferAllocator::with_config(AllocatorConfig {
        shmem_slot_count: slot_count,
        shmem_slot_len: 4096,
        capabilities: AllocatorCapabilities {
            supports_gpu_native: false,
        },
    });
    let link = Arc::clone(allocator.link());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let refuse_register = Arc::new(AtomicBool::new(false));
    let forwarder = Box::new(RecordingForwarder {
        allocator,
        calls: Arc::clone(&calls),
        refuse_register: Arc::clone(&refuse_register),
        sync,
    });
    let mut hosts: SlotMap<CompositableHandle, ()> = SlotMap::with_key();
    let compositable = hosts.insert(());
    let mut layers: SlotMap<LayerHandle, ()> = SlotMap::with_key();
    let layer = layers.insert(());
    (
        forwarder,
        Harness {
            calls,
            refuse_register,
            link,
            compositable,
            layer,
            _hosts: hosts,
            _layers: layers,
        },
    )
}

fn single_publisher(slot_count: u32) -> (SingleBufferPublisher, Harness) {
    let (forwarder, harness) = forwarder_with(slot_count, None);
    let publisher =
        SingleBufferPublisher::new(forwarder, harness.compositable, TextureFlags::default());
    (publisher, harness)
}

fn test_image(width: u32, height: u32) -> Arc<MemoryImage> {
    let size = ImageSize::new(width, height);
    let byte_len = size
        .byte_len(PixelFormat::Rgba8)
        .expect("test image byte length should fit") as usize;
    Arc::new(MemoryImage::new(
        PixelFormat::Rgba8,
        size,
        vec![0x7F; byte_len],
    ))
}

fn set_images(container: &ImageContainer, images: &[Arc<MemoryImage>]) {
    let frames = images
        .iter()
        .enumerate()
        .map(|(index, image)| {
            (
                Arc::clone(image) as Arc<dyn SourceImage>,
                FrameTimestamp(index as u64 * 1_000),
            )
        })
        .collect();
    container.set_current_images(frames);
}

fn calls_of(harness: &Harness) -> Vec<ForwarderCall> {
    harness
        .calls
        .lock()
        .expect("recorded calls lock should not be poisoned")
        .clone()
}

fn drain_calls(harness: &Harness) {
    harness
        .calls
        .lock()
        .expect("recorded calls lock should not be poisoned")
        .clear();
}

fn forwarded_serials(harness: &Harness) -> Vec<ForwarderCall> {
    calls_of(harness)
        .into_iter()
        .filter(|call| !matches!(call, ForwarderCall::Register(_)))
        .collect()
}

#[test]
fn unchanged_generation_is_an_observable_no_op() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    set_images(&container, &[test_image(2, 2)]);

    publisher
        .update_image(&container, ContentFlags::default())
        .expect("first publish should succeed");
    let slots_after_first = harness.link.arena().occupied_slots();
    drain_calls(&harness);

    publisher
        .update_image(&container, ContentFlags::default())
        .expect("same-generation publish should succeed");

    assert!(calls_of(&harness).is_empty());
    assert_eq!(harness.link.arena().occupied_slots(), slots_after_first);
    assert_eq!(publisher.binding_count(), 1);
}

#[test]
fn allocation_failure_leaves_the_working_set_untouched() {
    let (mut publisher, harness) = single_publisher(2);
    let container = ImageContainer::new(ProducerId(1));
    let frame_a = test_image(2, 2);
    set_images(&container, &[frame_a.clone()]);

    publisher
        .update_image(&container, ContentFlags::default())
        .expect("first publish should succeed");
    let kept = publisher
        .forwarded_texture()
        .expect("publisher should hold the first frame");
    drain_calls(&harness);

    // Three frames against a two-slot arena: A recycles, B takes the last
    // slot, C has nowhere to go.
    set_images(&container, &[frame_a, test_image(2, 2), test_image(2, 2)]);
    let error = publisher
        .update_image(&container, ContentFlags::default())
        .expect_err("third frame should exhaust the arena");

    assert!(matches!(error, UpdateImageError::TextureAcquisition(_)));
    assert_eq!(publisher.binding_count(), 1);
    assert!(
        publisher
            .forwarded_texture()
            .expect("working set should be untouched")
            .ptr_eq(&kept)
    );
    // B's fresh buffer must have been released again on abort.
    assert_eq!(harness.link.arena().occupied_slots(), 1);
    assert!(forwarded_serials(&harness).is_empty());
}

#[test]
fn failed_cycle_does_not_record_the_generation() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    set_images(&container, &[test_image(2, 2)]);

    harness.refuse_register.store(true, Ordering::Relaxed);
    assert_eq!(
        publisher.update_image(&container, ContentFlags::default()),
        Err(UpdateImageError::RegisterTextureFailed)
    );

    // Same generation, but the failure must not have been latched as seen.
    harness.refuse_register.store(false, Ordering::Relaxed);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("retry under the same generation should publish");
    assert_eq!(publisher.binding_count(), 1);
}

#[test]
fn additions_are_forwarded_before_removals() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    let frame_a = test_image(2, 2);
    let frame_b = test_image(2, 2);

    set_images(&container, &[frame_a.clone(), frame_b.clone()]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish of {A,B} should succeed");

    let serial_a = match &forwarded_serials(&harness)[..] {
        [ForwarderCall::Use(serials)] => serials[0],
        other => panic!("expected a single use batch, saw {other:?}"),
    };
    drain_calls(&harness);

    set_images(&container, &[frame_b, test_image(2, 2)]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish of {B,C} should succeed");

    let calls = forwarded_serials(&harness);
    assert_eq!(calls.len(), 2, "expected one use batch and one remove");
    let ForwarderCall::Use(used) = &calls[0] else {
        panic!("use batch must precede the removal, saw {calls:?}");
    };
    assert_eq!(used.len(), 2);
    assert_eq!(calls[1], ForwarderCall::Remove(serial_a));
}

#[test]
fn unchanged_frames_reuse_their_buffer() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    let frame = test_image(2, 2);

    set_images(&container, &[frame.clone()]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("first publish should succeed");
    let first = publisher
        .forwarded_texture()
        .expect("publisher should hold the frame");

    set_images(&container, &[frame]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("second publish should succeed");
    let second = publisher
        .forwarded_texture()
        .expect("publisher should still hold the frame");

    assert!(first.ptr_eq(&second), "recycled frame must keep its buffer");
    assert_eq!(harness.link.arena().occupied_slots(), 1);
}

#[test]
fn empty_snapshot_clears_the_working_set_successfully() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    set_images(&container, &[test_image(2, 2), test_image(2, 2)]);

    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish should succeed");
    drain_calls(&harness);

    container.clear_all_images();
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("racing clear must publish as an empty success");

    assert_eq!(publisher.binding_count(), 0);
    assert_eq!(publisher.forwarded_texture(), None);
    let removes = calls_of(&harness)
        .into_iter()
        .filter(|call| matches!(call, ForwarderCall::Remove(_)))
        .count();
    assert_eq!(removes, 2);
}

#[test]
fn invalid_frames_are_filtered_out_of_the_publish() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    let valid = test_image(2, 2);
    let invalid = test_image(2, 2);
    set_images(&container, &[invalid.clone(), valid.clone()]);
    invalid.mark_invalid();

    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish should succeed with the invalid frame dropped");

    assert_eq!(publisher.binding_count(), 1);
    let calls = forwarded_serials(&harness);
    let ForwarderCall::Use(used) = &calls[0] else {
        panic!("expected a use batch, saw {calls:?}");
    };
    assert_eq!(used.len(), 1);
    // The publisher's primary frame is the first valid one.
    let primary = publisher
        .forwarded_texture()
        .expect("valid frame should be forwarded");
    assert_eq!(primary.serial(), used[0]);
}

#[test]
fn full_snapshot_transition_scenario() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(7));
    let image_1 = test_image(2, 2);
    let image_2 = test_image(2, 2);

    // Publish {1,2}.
    set_images(&container, &[image_1.clone(), image_2.clone()]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish of {1,2} should succeed");
    assert_eq!(publisher.binding_count(), 2);
    let calls = forwarded_serials(&harness);
    let ForwarderCall::Use(first_used) = &calls[0] else {
        panic!("expected a use batch, saw {calls:?}");
    };
    assert_eq!(first_used.len(), 2);
    let serial_1 = first_used[0];
    let serial_2 = first_used[1];
    drain_calls(&harness);

    // Same generation: nothing at all.
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("same-generation publish should succeed");
    assert!(calls_of(&harness).is_empty());

    // {2,3}: 2 reused, 3 new, then remove 1.
    set_images(&container, &[image_2, test_image(2, 2)]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish of {2,3} should succeed");
    let calls = forwarded_serials(&harness);
    assert_eq!(calls.len(), 2);
    let ForwarderCall::Use(second_used) = &calls[0] else {
        panic!("expected a use batch first, saw {calls:?}");
    };
    assert_eq!(second_used[0], serial_2, "frame 2 must keep its buffer");
    assert_ne!(second_used[1], serial_1);
    assert_ne!(second_used[1], serial_2);
    assert_eq!(calls[1], ForwarderCall::Remove(serial_1));
    assert_eq!(publisher.binding_count(), 2);
}

#[test]
fn detach_clears_bindings_without_removals() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    set_images(&container, &[test_image(2, 2), test_image(2, 2)]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish should succeed");
    drain_calls(&harness);

    publisher.on_detach();

    assert!(publisher.is_detached());
    assert_eq!(publisher.binding_count(), 0);
    assert!(calls_of(&harness).is_empty(), "detach must not issue removes");
    assert_eq!(
        publisher.update_image(&container, ContentFlags::default()),
        Err(UpdateImageError::Detached)
    );
}

#[test]
fn flush_removes_every_forwarded_buffer() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    set_images(&container, &[test_image(2, 2), test_image(2, 2)]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish should succeed");
    drain_calls(&harness);

    publisher.flush_all_images();

    assert_eq!(publisher.binding_count(), 0);
    let removes = calls_of(&harness)
        .into_iter()
        .filter(|call| matches!(call, ForwarderCall::Remove(_)))
        .count();
    assert_eq!(removes, 2);
}

#[test]
fn closed_channel_drops_frames_silently() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    let frame = test_image(2, 2);
    set_images(&container, &[frame.clone()]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish should succeed");
    drain_calls(&harness);

    // Compositor restart between generations: the recycled buffer's channel
    // is gone, the frame is skipped without error.
    harness.link.close();
    set_images(&container, &[frame]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("closed channel must not surface as a publish error");

    assert_eq!(publisher.binding_count(), 0);
    let calls = forwarded_serials(&harness);
    assert_eq!(
        calls,
        vec![ForwarderCall::Use(Vec::new())],
        "the dropped frame enters neither the batch nor a removal"
    );
}

#[test]
fn sync_token_is_attached_after_upload() {
    let (forwarder, harness) = forwarder_with(8, Some(SyncToken(42)));
    let mut publisher =
        SingleBufferPublisher::new(forwarder, harness.compositable, TextureFlags::default());
    let container = ImageContainer::new(ProducerId(1));
    set_images(&container, &[test_image(2, 2)]);

    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish should succeed");

    let texture = publisher
        .forwarded_texture()
        .expect("publisher should hold the frame");
    assert_eq!(texture.sync_token(), Some(SyncToken(42)));
    assert!(texture.is_forwarded());
}

#[test]
fn image_owned_textures_skip_allocation() {
    let (mut publisher, harness) = single_publisher(8);
    let container = ImageContainer::new(ProducerId(1));
    let frame = test_image(2, 2);

    // Prime one cycle so the frame ends up owning a buffer on this link,
    // the way a producer that writes into its own texture would.
    let link_id = harness.link.id();
    set_images(&container, &[frame.clone()]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("priming publish should succeed");
    let pre_bound = publisher
        .forwarded_texture()
        .expect("publisher should hold the frame");
    frame.bind_texture(link_id, pre_bound.clone());
    drain_calls(&harness);

    set_images(&container, &[frame]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish with image-owned texture should succeed");

    let texture = publisher
        .forwarded_texture()
        .expect("publisher should hold the frame");
    assert!(texture.ptr_eq(&pre_bound));
    assert_eq!(harness.link.arena().occupied_slots(), 1);
}

#[test]
fn bridge_attaches_exactly_once_per_container_handle() {
    let (forwarder, harness) = forwarder_with(4, None);
    let mut publisher = BridgePublisher::new(forwarder);
    publisher.attach_layer(harness.layer);
    let container = ImageContainer::new(ProducerId(1));

    // Endpoint not ready: success without action.
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("missing container handle is success-without-action");
    assert!(calls_of(&harness).is_empty());

    container.set_async_container_handle(Some(AsyncContainerHandle(11)));
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("attach publish should succeed");
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("repeat publish should succeed");

    assert_eq!(
        calls_of(&harness),
        vec![ForwarderCall::Attach(
            AsyncContainerHandle(11),
            harness.layer
        )]
    );

    container.set_async_container_handle(Some(AsyncContainerHandle(12)));
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("re-attach publish should succeed");
    assert_eq!(calls_of(&harness).len(), 2);
}

#[test]
fn bridge_without_a_layer_fails() {
    let (forwarder, _harness) = forwarder_with(4, None);
    let mut publisher = BridgePublisher::new(forwarder);
    let container = ImageContainer::new(ProducerId(1));
    assert_eq!(
        publisher.update_image(&container, ContentFlags::default()),
        Err(UpdateImageError::LayerNotAttached)
    );
}

#[test]
fn factory_builds_the_tagged_variant() {
    let (forwarder, harness) = forwarder_with(4, None);
    let publisher = create_publisher(
        RawCompositableTag::SINGLE_BUFFER,
        forwarder,
        harness.compositable,
        TextureFlags::default(),
    )
    .expect("single-buffer tag should build a publisher");
    assert_eq!(publisher.kind(), CompositableKind::SingleBuffer);

    let (forwarder, harness) = forwarder_with(4, None);
    let publisher = create_publisher(
        RawCompositableTag::BRIDGE,
        forwarder,
        harness.compositable,
        TextureFlags::default(),
    )
    .expect("bridge tag should build a publisher");
    assert_eq!(publisher.kind(), CompositableKind::Bridge);

    let (forwarder, harness) = forwarder_with(4, None);
    assert!(
        create_publisher(
            RawCompositableTag::UNKNOWN,
            forwarder,
            harness.compositable,
            TextureFlags::default(),
        )
        .is_none()
    );
}

#[test]
fn variant_dispatch_routes_shared_operations() {
    let (forwarder, harness) = forwarder_with(8, None);
    let mut publisher = create_publisher(
        RawCompositableTag::SINGLE_BUFFER,
        forwarder,
        harness.compositable,
        TextureFlags::default(),
    )
    .expect("single-buffer tag should build a publisher");

    let container = ImageContainer::new(ProducerId(1));
    set_images(&container, &[test_image(2, 2)]);
    publisher
        .update_image(&container, ContentFlags::default())
        .expect("publish through the variant enum should succeed");
    assert!(publisher.forwarded_texture().is_some());

    publisher.on_detach();
    assert_eq!(
        publisher.update_image(&container, ContentFlags::default()),
        Err(UpdateImageError::Detached)
    );
}
