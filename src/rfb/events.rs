//! Typed event fan-out from the session task to observers.

use tokio::sync::mpsc;

use crate::rfb::types::Event;

/// A subscriber's end of the event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Publish/subscribe registry for session events.
///
/// Subscribers receive every event published after they subscribe, in
/// the order the session emitted them. Delivery iterates subscribers in
/// insertion order; receivers that have been dropped are pruned.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer.
    pub fn subscribe(&mut self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver one event to every live subscriber.
    pub fn publish(&mut self, event: &Event) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bus_is_empty() {
        assert_eq!(EventBus::new().subscriber_count(), 0);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let mut bus = EventBus::new();
        bus.publish(&Event::Bell);
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let mut bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(&Event::Connecting);
        bus.publish(&Event::Bell);
        bus.publish(&Event::Disconnected);

        assert_eq!(rx.recv().await, Some(Event::Connecting));
        assert_eq!(rx.recv().await, Some(Event::Bell));
        assert_eq!(rx.recv().await, Some(Event::Disconnected));
    }

    #[tokio::test]
    async fn all_subscribers_receive_each_event() {
        let mut bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(&Event::Bell);

        assert_eq!(a.recv().await, Some(Event::Bell));
        assert_eq!(b.recv().await, Some(Event::Bell));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut bus = EventBus::new();
        let rx = bus.subscribe();
        let _keep = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx);
        bus.publish(&Event::Bell);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let mut bus = EventBus::new();
        bus.publish(&Event::Connecting);

        let mut rx = bus.subscribe();
        bus.publish(&Event::Bell);

        assert_eq!(rx.recv().await, Some(Event::Bell));
    }
}
