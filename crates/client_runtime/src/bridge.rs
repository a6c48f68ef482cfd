use std::thread::JoinHandle;

use crate::update_ring::{ProducerUpdateHandle, PublisherUpdateQueue, create_update_ring};

/// Owns the publisher thread and its update ring. Owned by the thread that
/// creates publishers (typically the media or compositing setup path).
pub struct PublisherThreadBridge {
    pub update_handle: ProducerUpdateHandle,
    publisher_thread: Option<JoinHandle<()>>,
}

impl PublisherThreadBridge {
    /// Create the ring and hand its consuming end to the publisher thread.
    /// The spawned thread owns the publishers; this side only pings it.
    pub fn new<F>(update_capacity: usize, spawn_publisher: F) -> Self
    where
        F: FnOnce(PublisherUpdateQueue) -> JoinHandle<()>,
    {
        let (update_handle, update_queue) = create_update_ring(update_capacity);
        let publisher_thread = spawn_publisher(update_queue);
        Self {
            update_handle,
            publisher_thread: Some(publisher_thread),
        }
    }
}

impl Drop for PublisherThreadBridge {
    fn drop(&mut self) {
        // NOTE: the spawned thread must have its own shutdown condition
        // (detach of its publishers, a control request, a flag) before the
        // bridge is dropped; the ring itself never disconnects.
        if let Some(handle) = self.publisher_thread.take() {
            handle
                .join()
                .unwrap_or_else(|err| eprintln!("[error] publisher thread panic: {:?}", err));
        }
    }
}
