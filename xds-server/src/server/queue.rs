//! The shared push queue.
//!
//! Connections appear in the queue at most once. Enqueueing a
//! connection that is already queued, or whose push is currently being
//! delivered, merges the new request into the outstanding one instead
//! of growing the queue; back-pressure toward slow clients lives here
//! rather than in the per-connection push channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::connection::Connection;
use crate::model::context::PushRequest;

#[derive(Default)]
struct QueueState {
    /// Connections owed a push, oldest first.
    order: VecDeque<Arc<Connection>>,
    /// The outstanding request per queued connection id.
    pending: HashMap<String, PushRequest>,
    /// Connections whose push is being delivered right now. The slot
    /// collects requests that arrive mid-delivery.
    in_progress: HashMap<String, Option<PushRequest>>,
}

/// A merging, single-consumer queue of (connection, push request).
#[derive(Default)]
pub(crate) struct PushQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PushQueue {
    pub(crate) fn new() -> PushQueue {
        PushQueue::default()
    }

    /// Add a push for a connection, merging with any outstanding one.
    pub(crate) fn enqueue(&self, con: &Arc<Connection>, request: &PushRequest) {
        let mut state = self.state.lock().expect("push queue lock");
        let id = con.id();

        if let Some(slot) = state.in_progress.get_mut(id) {
            *slot = Some(match slot.take() {
                Some(existing) => existing.merge(request),
                None => request.clone(),
            });
            return;
        }

        if let Some(pending) = state.pending.get_mut(id) {
            *pending = pending.merge(request);
            return;
        }

        state.pending.insert(id.to_string(), request.clone());
        state.order.push_back(Arc::clone(con));
        drop(state);
        self.notify.notify_one();
    }

    /// Take the oldest queued push and mark its connection in progress.
    /// Waits until something is queued.
    pub(crate) async fn dequeue(&self) -> (Arc<Connection>, PushRequest) {
        loop {
            // Arm the wakeup before checking, so an enqueue between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("push queue lock");
                if let Some(con) = state.order.pop_front() {
                    let request = state
                        .pending
                        .remove(con.id())
                        .expect("queued connection has a pending request");
                    state.in_progress.insert(con.id().to_string(), None);
                    return (con, request);
                }
            }
            notified.await;
        }
    }

    /// Delivery for a connection finished. If pushes arrived while it
    /// was in progress, the connection goes back on the queue with the
    /// merged request.
    pub(crate) fn mark_done(&self, con: &Arc<Connection>) {
        let mut state = self.state.lock().expect("push queue lock");
        match state.in_progress.remove(con.id()) {
            Some(Some(request)) => {
                state.pending.insert(con.id().to_string(), request);
                state.order.push_back(Arc::clone(con));
                drop(state);
                self.notify.notify_one();
            }
            Some(None) | None => {}
        }
    }

    /// Number of connections waiting for delivery.
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().expect("push queue lock").order.len()
    }
}
