use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use compositor_protocol::ProducerId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use crossbeam_queue::ArrayQueue;

/// One "this container changed, publish it" ping from a producer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    pub producer_id: ProducerId,
    pub generation: u64,
}

// This ring is designed for single-producer, single-consumer use. The Arc
// inside ProducerUpdateHandle and PublisherUpdateQueue is not exposed,
// preventing accidental creation of additional producers or consumers.
struct SharedUpdateRing {
    // Producer-thread pushes are lock-free; when full we evict the oldest
    // request and keep the newest, since only the latest generation matters.
    queue: ArrayQueue<UpdateRequest>,
    notify_sender: Sender<()>,
    notify_receiver: Receiver<()>,
    dropped: AtomicU64,
    pushed: AtomicU64,
}

pub struct ProducerUpdateHandle {
    shared: Arc<SharedUpdateRing>,
    // Prevents accidental cloning or creation of additional producers.
    _not_clone: PhantomData<*const ()>,
}

impl ProducerUpdateHandle {
    pub fn push(&self, request: UpdateRequest) {
        let mut pending_request = request;
        loop {
            match self.shared.queue.push(pending_request) {
                Ok(()) => {
                    self.shared.pushed.fetch_add(1, Ordering::Relaxed);
                    match self.shared.notify_sender.try_send(()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(())) => {}
                        Err(TrySendError::Disconnected(())) => {
                            panic!("update ring notify channel disconnected")
                        }
                    }
                    return;
                }
                Err(returned_request) => {
                    pending_request = returned_request;
                    if self.shared.queue.pop().is_some() {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    pub fn dropped_requests(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed_requests(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }
}

pub struct PublisherUpdateQueue {
    shared: Arc<SharedUpdateRing>,
    // Prevents accidental cloning or creation of additional consumers.
    // `Cell<()>` keeps the queue !Sync (a single consumer is never shared by
    // reference) while staying Send so the bridge can hand it to the publisher
    // thread it spawns.
    _not_clone: PhantomData<std::cell::Cell<()>>,
}

/// Drain up to `max_items` requests into `output`.
///
/// NOTE:
/// - This function APPENDS to `output`.
/// - It does NOT clear the vector.
/// - Caller is responsible for calling `output.clear()` if needed.
/// - `output` capacity is reused to avoid reallocations.
impl PublisherUpdateQueue {
    pub fn drain_batch_with_wait(
        &self,
        output: &mut Vec<UpdateRequest>,
        max_items: usize,
        wait_timeout: Duration,
    ) {
        if max_items == 0 {
            return;
        }

        let mut drained_count = 0;
        while drained_count < max_items {
            match self.shared.queue.pop() {
                Some(request) => {
                    output.push(request);
                    drained_count += 1;
                }
                None => break,
            }
        }
        if drained_count > 0 || wait_timeout.is_zero() {
            return;
        }

        let wait_deadline = Instant::now() + wait_timeout;
        loop {
            let now = Instant::now();
            if now >= wait_deadline {
                return;
            }
            let remaining = wait_deadline.saturating_duration_since(now);
            match self.shared.notify_receiver.recv_timeout(remaining) {
                Ok(()) => {
                    while drained_count < max_items {
                        match self.shared.queue.pop() {
                            Some(request) => {
                                output.push(request);
                                drained_count += 1;
                            }
                            None => break,
                        }
                    }
                    if drained_count > 0 {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("update ring notify channel disconnected")
                }
            }
        }
    }

    pub fn dropped_requests(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

pub fn create_update_ring(capacity: usize) -> (ProducerUpdateHandle, PublisherUpdateQueue) {
    assert!(capacity > 0, "update ring capacity must be greater than zero");

    let (notify_sender, notify_receiver) = bounded(1);
    let shared = Arc::new(SharedUpdateRing {
        queue: ArrayQueue::new(capacity),
        notify_sender,
        notify_receiver,
        dropped: AtomicU64::new(0),
        pushed: AtomicU64::new(0),
    });

    (
        ProducerUpdateHandle {
            shared: Arc::clone(&shared),
            _not_clone: PhantomData,
        },
        PublisherUpdateQueue {
            shared,
            _not_clone: PhantomData,
        },
    )
}
