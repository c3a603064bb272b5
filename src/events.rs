//! Notifications for code observing the load.
//!
//! Events carry as little as possible. `DataUpdated` in particular has no
//! payload: subscribers re-read the accessors on [`crate::device::Engine`] or
//! [`crate::load::ElectronicLoad`]. All events from one telemetry cycle are
//! sent from the poll loop in order, so a subscriber sees `DataUpdated`
//! before any stop or trip caused by the same sample.

use tokio::sync::broadcast;

/// Default channel depth. Slow subscribers past this lag and skip events.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something observable happened.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    /// A telemetry frame was decoded (or cached state was reset on disconnect).
    DataUpdated,
    /// Connected to `port`, or disconnected when `port` is `None`.
    ConnectionChanged {
        /// Port now in use.
        port: Option<String>,
    },
    /// The link failed during polling and was torn down.
    ConnectionLost(String),
    /// Reported firmware is older than supported. Not fatal.
    FirmwareWarning(String),
    /// A program run began.
    ProgramStarted,
    /// A program run ended and the load was driven to zero current.
    ProgramStopped,
    /// A program item failed, usually a set-point out of range.
    ProgramFailed(String),
    /// Device error flags were raised; carries the formatted error list.
    DeviceErrors(String),
    /// The value watchdog stopped the load.
    WatchdogTripped,
    /// The series resistance power watchdog stopped the load.
    SeriesResistanceWatchdogTripped,
}

/// Broadcast fan-out for [`LoadEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LoadEvent>,
}

impl EventBus {
    /// Bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LoadEvent> {
        self.sender.subscribe()
    }

    /// Send to every current subscriber. Having none is not an error.
    pub fn emit(&self, event: LoadEvent) {
        let _ = self.sender.send(event);
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(LoadEvent::DataUpdated);
        bus.emit(LoadEvent::WatchdogTripped);

        assert_eq!(rx.recv().await.unwrap(), LoadEvent::DataUpdated);
        assert_eq!(rx.recv().await.unwrap(), LoadEvent::WatchdogTripped);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.emit(LoadEvent::ProgramStarted);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
