//! Thread-safe priority queue over inbound messages.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::internal::message::Message;

/// Heap entry; ordered by priority (higher first), then arrival order
/// (earlier first). The sequence number makes ties FIFO instead of leaving
/// the order to heap internals.
struct Entry {
    priority: i32,
    seq: u64,
    msg: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Thread-safe, priority-ordered message queue with a blocking pop.
pub(crate) struct MessageQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        MessageQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Inserts a message; wakes one waiter.
    pub(crate) fn push(&self, msg: Message) {
        {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry {
                priority: msg.meta.priority,
                seq,
                msg,
            });
        }
        self.notify.notify_one();
    }

    /// Waits until the queue is non-empty and pops the front message.
    pub(crate) async fn wait_and_pop(&self) -> Message {
        loop {
            // arm the notification before checking, so a push between the
            // check and the await is not lost
            let notified = self.notify.notified();
            if let Some(entry) = self.inner.lock().unwrap().heap.pop() {
                return entry.msg;
            }
            notified.await;
        }
    }
}
