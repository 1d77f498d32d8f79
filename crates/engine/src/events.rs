// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Notifications posted by a [`DecodeBin`](crate::DecodeBin).

use decodekit_core::{Caps, Pad};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Something observable happened inside the bin.
#[derive(Debug, Clone)]
pub enum BinEvent {
    /// Type detection finished. Posted once per stream, before any chain is
    /// built.
    HaveType { probability: u32, caps: Caps },
    /// A source pad was exposed.
    PadAdded { pad: Pad, caps: Option<Caps> },
    /// An exposed source pad was removed.
    PadRemoved { pad: Pad },
    /// Every stream found so far has been exposed and no more will follow.
    NoMorePads,
    /// A branch died because nothing can handle its caps.
    MissingPlugin { caps: Caps, detail: String },
    /// A fatal condition for the whole bin.
    Error { message: String },
}

/// Fan-out of [`BinEvent`]s to any number of subscribers.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BinEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BinEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers to every live subscriber; closed ones are pruned.
    pub fn post(&self, event: &BinEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::default();
        let mut alive = bus.subscribe();
        let dead = bus.subscribe();
        drop(dead);

        bus.post(&BinEvent::NoMorePads);
        assert!(matches!(alive.try_recv(), Ok(BinEvent::NoMorePads)));
        assert_eq!(bus.subscribers.lock().len(), 1);
    }
}
