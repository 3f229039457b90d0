//! Coalescing work queue with per-key exclusivity.
//!
//! A key is at most once in the queue (`dirty`) and at most once in flight
//! (`processing`). Adding a key that is in flight only marks it dirty; `done` puts it
//! back at the tail so the next dispatch sees the latest state.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use rustc_hash::FxHashSet;
use tether_core::ObjectId;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectId>,
    dirty: FxHashSet<ObjectId>,
    processing: FxHashSet<ObjectId>,
    shutting_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Point-in-time view used for debug introspection.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub queued: Vec<ObjectId>,
    pub in_flight: Vec<ObjectId>,
}

impl WorkQueue {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, QueueState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Returns false when the key was already pending (coalesced) or the queue is shut down.
    pub fn add(&self, id: ObjectId) -> bool {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&id) {
            return false;
        }
        st.dirty.insert(id.clone());
        if !st.processing.contains(&id) {
            st.queue.push_back(id);
            drop(st);
            self.notify.notify_one();
        }
        true
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectId> {
        loop {
            let notified = self.notify.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(id) = st.queue.pop_front() {
                    st.dirty.remove(&id);
                    st.processing.insert(id.clone());
                    return Some(id);
                }
            }
            notified.await;
        }
    }

    /// Release an in-flight key; re-queues it if it was added meanwhile.
    pub fn done(&self, id: &ObjectId) {
        let mut st = self.lock();
        st.processing.remove(id);
        if st.dirty.contains(id) && !st.shutting_down {
            st.queue.push_back(id.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn snapshot(&self) -> QueueSnapshot {
        let st = self.lock();
        QueueSnapshot { queued: st.queue.iter().cloned().collect(), in_flight: st.processing.iter().cloned().collect() }
    }
}
