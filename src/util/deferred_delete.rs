//! Frame-count based deferred deletion.
//!
//! GPU work referencing a resource may still be in flight for a few frames after the CPU is done with it.
//! Instead of tracking every use, resources are pushed onto a queue and released after a fixed number of frames.

use std::any::Any;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct Item<T> {
    value: T,
    // Time to live
    ttl: u32,
}

/// Queue of values that are dropped a fixed number of frames after being pushed.
#[derive(Debug)]
pub struct DeletionQueue<T> {
    max_ttl: u32,
    items: Vec<Item<T>>,
}

impl<T> DeletionQueue<T> {
    /// Create a queue that keeps values alive for `max_ttl` calls to [`DeletionQueue::next_frame()`].
    pub fn new(max_ttl: u32) -> DeletionQueue<T> {
        DeletionQueue {
            max_ttl,
            items: vec![],
        }
    }

    /// Pushes a value onto the deletion queue.
    /// Note that this moves out of the parameter so that you can't access an object after
    /// it is pushed.
    pub fn push(&mut self, value: T) {
        self.items.push(Item {
            value,
            ttl: self.max_ttl,
        });
    }

    /// Advance the frame counter by one, decreasing time to live by one on each element.
    /// If time to live of an element reaches zero, it is deleted.
    pub fn next_frame(&mut self) {
        self.items
            .iter_mut()
            .for_each(|item| item.ttl = item.ttl.saturating_sub(1));
        self.items.retain(|item| item.ttl != 0);
    }

    /// Drop every queued value immediately. Only safe once the GPU is idle.
    pub fn flush(&mut self) {
        self.items.clear();
    }

    /// Number of values waiting for deletion.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no values are waiting for deletion.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over the values waiting for deletion.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter().map(|item| &item.value)
    }
}

/// Type-erased, shareable [`DeletionQueue`] owned by a device. Any GPU object can be pushed onto it,
/// the render loop calls [`DeferredDelete::next_frame()`] once per frame.
#[derive(Debug, Clone)]
pub struct DeferredDelete {
    queue: Arc<Mutex<DeletionQueue<Box<dyn Any + Send>>>>,
}

impl DeferredDelete {
    /// Create a deferred deletion facility that waits `frames` frames before dropping objects.
    pub fn new(frames: u32) -> Self {
        Self {
            queue: Arc::new(Mutex::new(DeletionQueue::new(frames))),
        }
    }

    /// Schedule `value` for destruction.
    pub fn push<T: Send + 'static>(&self, value: T) {
        // A poisoned queue still holds valid items, deletion must not be skipped.
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(Box::new(value));
    }

    /// Advance one frame, dropping objects whose time ran out.
    pub fn next_frame(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.next_frame();
    }

    /// Drop everything now. Only call this after waiting for the device to go idle.
    pub fn flush(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.flush();
    }

    /// Number of objects waiting for destruction.
    pub fn len(&self) -> usize {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.len()
    }

    /// Whether nothing is waiting for destruction.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
