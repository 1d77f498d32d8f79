// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Synchronous multi-subscriber signals with RAII disconnection.
//!
//! Handlers run on the emitting thread. Dropping the [`SignalHandle`]
//! returned by [`Signal::connect`] disconnects the handler, so a handler can
//! never outlive the object that registered it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
    next_id: AtomicU64,
}

/// A list of handlers invoked by [`Signal::emit`].
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers `handler`; it stays connected while the handle lives.
    #[must_use = "dropping the handle disconnects the handler"]
    pub fn connect<F>(&self, handler: F) -> SignalHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        SignalHandle {
            disconnect: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handlers.lock().retain(|(hid, _)| *hid != id);
                }
            })),
        }
    }

    /// Invokes every connected handler. Handlers connected or disconnected
    /// during emission take effect on the next emission.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> =
            self.inner.handlers.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in snapshot {
            handler(value);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("handlers", &self.inner.handlers.lock().len()).finish()
    }
}

/// Owned subscription; disconnects its handler when dropped.
pub struct SignalHandle {
    disconnect: Option<Box<dyn FnOnce() + Send>>,
}

impl SignalHandle {
    /// Disconnects now.
    pub fn disconnect(mut self) {
        if let Some(f) = self.disconnect.take() {
            f();
        }
    }
}

impl Drop for SignalHandle {
    fn drop(&mut self) {
        if let Some(f) = self.disconnect.take() {
            f();
        }
    }
}

impl std::fmt::Debug for SignalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandle").field("connected", &self.disconnect.is_some()).finish()
    }
}
