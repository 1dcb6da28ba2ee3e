//! Event bus between observer callbacks and the monitor loop.
//!
//! Callbacks run on the dispatcher task and must not block, so they only
//! push into a broadcast channel; the main loop drains it.

use capy_signals::Notification;
use std::sync::OnceLock;
use tokio::sync::broadcast::{self, Receiver, Sender};

/// Broadcast channel capacity.
/// Lagging receivers skip old notifications.
pub const CHANNEL_CAPACITY: usize = 64;

static SENDER: OnceLock<Sender<Notification>> = OnceLock::new();

fn get_sender() -> &'static Sender<Notification> {
    SENDER.get_or_init(|| {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        tx
    })
}

/// Non-blocking. Dropped if nobody subscribed yet.
#[inline]
pub fn send(notification: Notification) {
    let _ = get_sender().send(notification);
}

pub fn subscribe() -> Receiver<Notification> {
    get_sender().subscribe()
}
