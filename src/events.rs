//! Channel-backed listener for hosts that would rather poll than implement
//! `WakeListener`.

use crossbeam_channel as cb;
use tracing::warn;

use crate::engine::WakeListener;
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Detected { score: f32 },
    Error(String),
}

/// Forwards every callback into an unbounded channel.
#[derive(Clone)]
pub struct ChannelListener {
    tx: cb::Sender<EngineEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, cb::Receiver<EngineEvent>) {
        let (tx, rx) = cb::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            warn!("engine event dropped: receiver gone");
        }
    }
}

impl WakeListener for ChannelListener {
    fn on_detected(&self, score: f32) {
        self.send(EngineEvent::Detected { score });
    }

    fn on_error(&self, error: &EngineError) {
        self.send(EngineEvent::Error(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_callbacks_in_order() {
        let (listener, rx) = ChannelListener::new();
        listener.on_detected(0.8);
        listener.on_error(&EngineError::PermissionDenied);
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Detected { score: 0.8 });
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::Error(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);
        listener.on_detected(0.9);
    }
}
