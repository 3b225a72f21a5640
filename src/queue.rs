//! Bounded, blocking inter-stage queue with push-side uniqueness.
//!
//! Two condition variables guard one mutex: `not_empty` wakes a blocked
//! `pop`, `not_full` wakes a blocked `push`. A payload already queued is not
//! enqueued again — its tag is merged into the existing entry instead. This
//! is how a storm of filesystem MODIFY events collapses into a single
//! pending FILE-UPDATE message per file, upgraded to FILE-CLOSE if a close
//! arrives before the parser catches up.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Identity comparison for a queued payload. `Arc` pointer equality, not
/// value equality — two different files with identical contents are still
/// two different payloads.
pub trait Payload {
    fn same_payload(&self, other: &Self) -> bool;
}

impl<T> Payload for Arc<T> {
    fn same_payload(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

/// Result of [`MessageQueue::pop_timeout`].
pub enum PopOutcome<P, T> {
    Message(P, T),
    Timeout,
    Closed,
}

struct Envelope<P, T> {
    payload: P,
    tag: T,
}

struct Inner<P, T> {
    items: VecDeque<Envelope<P, T>>,
    closed: bool,
}

/// A bounded queue of `(payload, tag)` pairs, deduplicated by payload
/// identity. `capacity == 0` means unlimited growth — used for the
/// watcher→parser queue, where push-side uniqueness already keeps it
/// small.
pub struct MessageQueue<P, T> {
    inner: Mutex<Inner<P, T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<P, T> MessageQueue<P, T>
where
    P: Payload,
    T: Ord + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Pushes `(payload, tag)`, blocking while the queue is full.
    ///
    /// If an entry for the same payload is already queued, its tag is
    /// replaced by `max(existing tag, tag)` and no new slot is consumed —
    /// this is what lets `Close` supersede a pending `Update` without
    /// growing the queue. Returns immediately (dropping the message) if the
    /// queue has been closed.
    pub fn push(&self, payload: P, tag: T) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if guard.closed {
                return;
            }
            if let Some(existing) = guard
                .items
                .iter_mut()
                .find(|e| e.payload.same_payload(&payload))
            {
                if tag > existing.tag {
                    existing.tag = tag;
                }
                self.not_empty.notify_one();
                return;
            }
            if self.capacity == 0 || guard.items.len() < self.capacity {
                guard.items.push_back(Envelope { payload, tag });
                self.not_empty.notify_one();
                return;
            }
            guard = self.not_full.wait(guard).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Blocks until a message is available or the queue is closed and
    /// drained, in which case `None` is returned.
    pub fn pop(&self) -> Option<(P, T)> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(envelope) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Some((envelope.payload, envelope.tag));
            }
            if guard.closed {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Blocks for at most `timeout` waiting for a message. The writer
    /// derives `timeout` from its batching policy so this wakes on
    /// whichever commit trigger fires first.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> PopOutcome<P, T> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(envelope) = guard.items.pop_front() {
                self.not_full.notify_one();
                return PopOutcome::Message(envelope.payload, envelope.tag);
            }
            if guard.closed {
                return PopOutcome::Closed;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return PopOutcome::Timeout;
            }
            let (next_guard, result) = self
                .not_empty
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            guard = next_guard;
            if result.timed_out() && guard.items.is_empty() && !guard.closed {
                return PopOutcome::Timeout;
            }
        }
    }

    /// Marks the queue closed and wakes every blocked `push`/`pop`. Further
    /// pushes are dropped; pending items already queued still drain via
    /// `pop` until empty.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
    enum Tag {
        Update,
        Close,
    }

    #[test]
    fn duplicate_payload_merges_tag_instead_of_enqueuing() {
        let q: MessageQueue<Arc<i32>, Tag> = MessageQueue::new(4);
        let item = Arc::new(1);
        q.push(item.clone(), Tag::Update);
        q.push(item.clone(), Tag::Update);
        q.push(item.clone(), Tag::Close);
        assert_eq!(q.len(), 1);
        let (_, tag) = q.pop().unwrap();
        assert_eq!(tag, Tag::Close);
    }

    #[test]
    fn distinct_payloads_both_enqueue() {
        let q: MessageQueue<Arc<i32>, Tag> = MessageQueue::new(4);
        q.push(Arc::new(1), Tag::Update);
        q.push(Arc::new(2), Tag::Update);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pop_blocks_until_push_then_returns_value() {
        let q = Arc::new(MessageQueue::<Arc<i32>, Tag>::new(4));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(20));
        q.push(Arc::new(42), Tag::Update);
        let (payload, tag) = handle.join().unwrap().unwrap();
        assert_eq!(*payload, 42);
        assert_eq!(tag, Tag::Update);
    }

    #[test]
    fn pop_timeout_returns_timeout_when_nothing_arrives() {
        let q: MessageQueue<Arc<i32>, Tag> = MessageQueue::new(4);
        let outcome = q.pop_timeout(Duration::from_millis(20));
        assert!(matches!(outcome, PopOutcome::Timeout));
    }

    #[test]
    fn pop_timeout_returns_message_when_one_arrives_in_time() {
        let q = Arc::new(MessageQueue::<Arc<i32>, Tag>::new(4));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop_timeout(Duration::from_millis(500)));
        thread::sleep(Duration::from_millis(20));
        q.push(Arc::new(7), Tag::Update);
        match handle.join().unwrap() {
            PopOutcome::Message(payload, tag) => {
                assert_eq!(*payload, 7);
                assert_eq!(tag, Tag::Update);
            }
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn close_unblocks_pop_with_none() {
        let q = Arc::new(MessageQueue::<Arc<i32>, Tag>::new(4));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn push_blocks_while_full_until_pop_frees_a_slot() {
        let q = Arc::new(MessageQueue::<Arc<i32>, Tag>::new(1));
        q.push(Arc::new(1), Tag::Update);
        let q2 = q.clone();
        let handle = thread::spawn(move || {
            q2.push(Arc::new(2), Tag::Update);
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 1);
        q.pop();
        handle.join().unwrap();
        assert_eq!(q.len(), 1);
    }
}
