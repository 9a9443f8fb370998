use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::SessionEvent;

/// Event stream type
pub type SessionEventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_BUFFER: usize = 128;

/// Fan-out of session events to any number of subscribers.
///
/// Publishing never blocks and never fails; with no subscribers events are
/// simply dropped. Slow subscribers skip what they missed.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> SessionEventStream {
        Box::pin(BroadcastStream::new(self.tx.subscribe()).filter_map(|item| item.ok()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ActionKind;

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let hub = EventHub::new();
        let mut stream = hub.subscribe();

        hub.publish(SessionEvent::submitted("9001", ActionKind::Generate));
        hub.publish(SessionEvent::poll_attempt("9001", 1, 30));
        hub.publish(SessionEvent::timed_out("9001", 30));
        drop(hub);

        let mut kinds = Vec::new();
        while let Some(event) = stream.next().await {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds, vec!["Submitted", "PollAttempt", "TimedOut"]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let hub = EventHub::new();
        hub.publish(SessionEvent::reset("9001"));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_late_subscriber_only_sees_new_events() {
        let hub = EventHub::new();
        hub.publish(SessionEvent::reset("old"));

        let mut stream = hub.subscribe();
        hub.publish(SessionEvent::reset("new"));
        drop(hub);

        let first = stream.next().await.unwrap();
        assert_eq!(first.target(), "new");
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_stream_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<SessionEventStream>();
    }
}
