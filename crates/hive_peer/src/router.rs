//! Ordered handler lists with owned unsubscribe handles.
//!
//! Handlers are invoked in registration order. Registering returns a
//! [`Subscription`]; dropping it keeps the handler registered, calling
//! [`Subscription::unsubscribe`] removes exactly that handler.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::identity::PeerId;

/// Callback for an inbound application message: `(sender, payload)`.
pub type MessageHandler = Arc<dyn Fn(&PeerId, &Value) + Send + Sync>;

/// Handlers in registration order, each with a stable id.
pub struct HandlerList<H> {
    next_id: u64,
    entries: Vec<(u64, H)>,
}

impl<H: Clone> HandlerList<H> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Append a handler, returning the id used to remove it.
    pub fn add(&mut self, handler: H) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, handler));
        id
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Copy of the handlers so they can be called without holding a lock.
    pub fn snapshot(&self) -> Vec<H> {
        self.entries.iter().map(|(_, h)| h.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H: Clone> Default for HandlerList<H> {
    fn default() -> Self {
        Self::new()
    }
}

type CancelFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Handle returned by every `subscribe_*` call.
#[must_use = "dropping a Subscription leaves the handler registered"]
pub struct Subscription {
    cancel: Option<CancelFn>,
}

impl Subscription {
    /// A subscription whose removal needs no I/O.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(move || {
                cancel();
                futures::future::ready(()).boxed()
            })),
        }
    }

    /// A subscription whose removal finishes asynchronously (e.g. a
    /// transport-level unsubscribe).
    pub fn new_async<F>(cancel: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the handler and wait for any resulting cleanup.
    pub async fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel().await;
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
