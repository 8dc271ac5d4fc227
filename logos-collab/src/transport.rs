//! Transport contract and the channel-backed implementation.
//!
//! The engine never awaits a send. [`Transport::send`] reports immediately
//! whether the frame was handed off; delivery is confirmed later by an
//! `ack` frame.

use std::sync::RwLock;

use tokio::sync::mpsc;

pub trait Transport: Send + Sync {
    /// Hand a frame to the connection. `false` means it was not accepted.
    fn send(&self, bytes: Vec<u8>) -> bool;
}

/// Transport writing into a bounded channel drained by a connection task.
///
/// The channel is swapped on every (re)connect; while detached every send
/// fails, which the outbound queue treats as a transient failure.
#[derive(Default)]
pub struct ChannelTransport {
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route sends into a new connection.
    pub fn attach(&self, outgoing: mpsc::Sender<Vec<u8>>) {
        if let Ok(mut slot) = self.outgoing.write() {
            *slot = Some(outgoing);
        }
    }

    pub fn detach(&self) {
        if let Ok(mut slot) = self.outgoing.write() {
            *slot = None;
        }
    }

    pub fn is_attached(&self) -> bool {
        self.outgoing
            .read()
            .map(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, bytes: Vec<u8>) -> bool {
        match self.outgoing.read() {
            Ok(slot) => slot
                .as_ref()
                .is_some_and(|tx| tx.try_send(bytes).is_ok()),
            Err(_) => false,
        }
    }
}
