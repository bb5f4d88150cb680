//! Fan-out of resolution events to live subscribers.
//!
//! Backed by a `tokio::sync::broadcast` channel: publishing never blocks, and
//! a subscriber that falls more than `capacity` events behind loses the
//! oldest ones and is told how many it missed.

use revisit_core::ResolutionEvent;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventBusError {
    #[error("event bus closed")]
    Closed,
    #[error("subscriber lagged; {0} events dropped")]
    Lagged(u64),
    #[error("no event available")]
    Empty,
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ResolutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: ResolutionEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                tracing::trace!("no subscribers for resolution event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<ResolutionEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<ResolutionEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                tracing::warn!(dropped = n, "event subscriber lagged");
                EventBusError::Lagged(n)
            }
        })
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Result<ResolutionEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                tracing::warn!(dropped = n, "event subscriber lagged");
                EventBusError::Lagged(n)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use revisit_core::{ObservationId, VisitorId};

    fn event(visit_count: u32) -> ResolutionEvent {
        ResolutionEvent {
            observation_id: ObservationId::new(),
            visitor_id: VisitorId(1),
            name: "Unknown Visitor".into(),
            is_known: visit_count > 1,
            confidence: 0.0,
            timestamp: Utc::now(),
            visit_count,
            camera_id: None,
            image_path: None,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.publish(event(1)), 2);
        assert_eq!(a.recv().await.unwrap().visit_count, 1);
        assert_eq!(b.recv().await.unwrap().visit_count, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish(event(1)), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        for n in 1..=5 {
            bus.publish(event(n));
        }

        assert_eq!(slow.try_recv(), Err(EventBusError::Lagged(3)));
        assert_eq!(slow.recv().await.unwrap().visit_count, 4);
        assert_eq!(slow.recv().await.unwrap().visit_count, 5);
        assert_eq!(slow.try_recv(), Err(EventBusError::Empty));
    }
}
