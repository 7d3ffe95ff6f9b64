//! Event Bus (Layer 5)
//!
//! Decouples connection lifecycle changes from whoever reacts to them.
//! The connection manager publishes, any number of subscribers listen.

use tokio::sync::broadcast;

/// Fan-out of events to any number of subscribers.
///
/// Events published while nobody is subscribed are dropped. A subscriber that
/// falls more than `capacity` events behind observes `RecvError::Lagged` and
/// continues from the oldest retained event.
///
/// # Type Parameters
/// * `E` - Event type (must be Clone for broadcasting)
pub struct EventBus<E> {
    /// Broadcast channel sender
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a new EventBus
    ///
    /// # Arguments
    /// * `capacity` - Events buffered per subscriber before it starts lagging
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers
    ///
    /// # Arguments
    /// * `event` - The event to broadcast
    ///
    /// # Returns
    /// Number of subscribers that received the event
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum TestEvent {
        Up(u64),
        Down(u64),
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.publish(TestEvent::Up(1)), 2);

        assert_eq!(rx1.recv().await.unwrap(), TestEvent::Up(1));
        assert_eq!(rx2.recv().await.unwrap(), TestEvent::Up(1));
    }

    #[tokio::test]
    async fn test_event_bus_no_subscribers() {
        let bus: EventBus<TestEvent> = EventBus::new(10);
        assert_eq!(bus.publish(TestEvent::Down(1)), 0);
    }

    #[tokio::test]
    async fn test_event_bus_preserves_order() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();

        bus.publish(TestEvent::Down(7));
        bus.publish(TestEvent::Up(7));

        assert_eq!(rx.recv().await.unwrap(), TestEvent::Down(7));
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Up(7));
    }

    #[tokio::test]
    async fn test_event_bus_subscriber_drop() {
        let bus = EventBus::new(10);
        let rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.publish(TestEvent::Down(3)), 2);
        assert_eq!(rx2.recv().await.unwrap(), TestEvent::Down(3));

        drop(rx1);

        assert_eq!(bus.publish(TestEvent::Up(3)), 1);
        assert_eq!(rx2.recv().await.unwrap(), TestEvent::Up(3));
    }
}
