use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// A multi-producer/multi-consumer blocking FIFO.
///
/// Two of these decouple the bus's worker threads: one between the socket
/// receive thread and the packer, one between the packer and the dispatcher.
/// `enqueue` never blocks and never fails. Consumers either poll with
/// `dequeue` or block in `wait_dequeue`, which also wakes up empty-handed
/// once `break_all_wait` has been called. The break signal is sticky until
/// `reset` re-arms the queue for a new session.
pub struct ThreadSafeQueue<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    break_all_wait: AtomicBool,
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> Self {
        ThreadSafeQueue {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            break_all_wait: AtomicBool::new(false),
        }
    }

    /// Appends an element and wakes one waiting consumer.
    pub fn enqueue(&self, element: T) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(element);
        self.available.notify_one();
    }

    /// Removes the front element if one is present.
    pub fn dequeue(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Blocks until an element is available or the queue has been broken.
    ///
    /// Returns `None` once `break_all_wait` has been called, even if elements
    /// remain queued; the break signal marks the end of a session.
    pub fn wait_dequeue(&self) -> Option<T> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if self.break_all_wait.load(Ordering::Acquire) {
                return None;
            }
            if let Some(element) = queue.pop_front() {
                return Some(element);
            }
            queue = self.available.wait(queue).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Drops every queued element.
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }

    /// Wakes every blocked consumer and makes future waits return
    /// immediately.
    pub fn break_all_wait(&self) {
        // The flag is flipped under the queue lock so that a consumer cannot
        // observe it unset and then sleep through the notification.
        let _queue = self.queue.lock().unwrap();
        self.break_all_wait.store(true, Ordering::Release);
        self.available.notify_all();
    }

    /// Re-arms the queue after a break.
    pub fn reset(&self) {
        self.break_all_wait.store(false, Ordering::Release);
    }
}
