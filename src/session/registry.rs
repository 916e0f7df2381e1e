//! Correlated call registry: maps an in-flight call's `rqid` to its
//! private fragment queue and wake signal.
//!
//! The registry is the only structure touched by both the receive loop
//! and every dispatching caller, so all operations go through a single
//! lock with short critical sections. Waiting never happens under the
//! lock; callers park on their own call's [`tokio::sync::Notify`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::session::message::Message;

/// One outstanding logical call.
pub struct PendingCall {
    queue: Mutex<VecDeque<Message>>,
    wake: Notify,
    still_working: AtomicBool,
}

impl PendingCall {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            still_working: AtomicBool::new(true),
        }
    }

    /// Appends a response fragment and raises the wake signal.
    pub fn enqueue(&self, message: Message) {
        self.queue.lock().expect("pending call queue poisoned").push_back(message);
        self.wake.notify_one();
    }

    /// Takes the oldest queued fragment, if any.
    pub fn dequeue(&self) -> Option<Message> {
        self.queue.lock().expect("pending call queue poisoned").pop_front()
    }

    /// True until the session cancels the call (disconnect) or the
    /// dispatcher observes the final fragment.
    pub fn is_working(&self) -> bool {
        self.still_working.load(Ordering::Acquire)
    }

    pub fn stop_working(&self) {
        self.still_working.store(false, Ordering::Release);
    }

    /// Parks until the next enqueue or cancellation wake. `notify_one`
    /// stores a permit, so a wake that races this await is not lost.
    pub async fn wait(&self) {
        self.wake.notified().await;
    }
}

/// Thread-safe `rqid -> PendingCall` map shared by the receive loop and
/// all dispatchers.
#[derive(Default)]
pub struct CallRegistry {
    calls: Mutex<HashMap<u64, Arc<PendingCall>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh call under `rqid`. Ids must be unique among
    /// concurrently live calls; a duplicate is a caller bug.
    pub fn register(&self, rqid: u64) -> Result<Arc<PendingCall>> {
        let mut calls = self.calls.lock().expect("call registry poisoned");
        if calls.contains_key(&rqid) {
            return Err(Error::Protocol(format!(
                "correlation id {rqid} already has a pending call"
            )));
        }
        let call = Arc::new(PendingCall::new());
        calls.insert(rqid, call.clone());
        Ok(call)
    }

    pub fn lookup(&self, rqid: u64) -> Option<Arc<PendingCall>> {
        self.calls.lock().expect("call registry poisoned").get(&rqid).cloned()
    }

    pub fn remove(&self, rqid: u64) {
        self.calls.lock().expect("call registry poisoned").remove(&rqid);
    }

    pub fn len(&self) -> usize {
        self.calls.lock().expect("call registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every registered call without removing it: each call is
    /// marked no-longer-working and woken, and the blocked dispatcher
    /// unregisters itself on the way out. Used on disconnect.
    pub fn reset_all(&self) {
        let calls = self.calls.lock().expect("call registry poisoned");
        if !calls.is_empty() {
            tracing::warn!(pending = calls.len(), "cancelling all pending calls");
        }
        for call in calls.values() {
            call.stop_working();
            call.wake.notify_one();
        }
    }
}
