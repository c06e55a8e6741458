//! Typed publish/subscribe event channel.
//!
//! Each event name maps to exactly one payload type through the [`Event`]
//! enum. Publishers hold a cloned [`EventBus`]; consumers call
//! [`EventBus::subscribe_to`] with the kinds they care about.
//!
//! Events serialize with the event name as the `event` tag, e.g.
//! `{"event":"destination_reached","destination":"Jiujiang",...}`.

use chrono::NaiveDateTime;
use log::warn;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::decision::Suggestion;
use crate::traffic::TrafficLevel;
use crate::Position;

/// An accepted position and the one it replaced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionUpdate {
    pub current: Position,
    pub previous: Option<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationStarted {
    pub destination: String,
    pub total_distance_km: f64,
    pub initial_eta_seconds: f64,
    pub started_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationStopped {
    pub remaining_distance_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationReached {
    pub destination: String,
    pub total_distance_km: f64,
    pub elapsed_seconds: i64,
}

/// A voice prompt for the next turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnInstruction {
    /// Outer edge of the band that fired (50, 200 or 500 with defaults)
    pub band_m: f64,
    pub distance_m: f64,
    pub instruction: String,
    pub text: String,
}

/// Why a traffic notification was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficNotificationKind {
    SignificantChange,
    EnteringCongestionZone,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficNotification {
    pub kind: TrafficNotificationKind,
    pub zone_id: String,
    pub zone_name: String,
    pub title: String,
    pub message: String,
    pub from: Option<TrafficLevel>,
    pub to: TrafficLevel,
    pub priority: crate::decision::Priority,
    pub at: NaiveDateTime,
}

/// Everything the engine publishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PositionUpdate(PositionUpdate),
    NavigationStarted(NavigationStarted),
    NavigationStopped(NavigationStopped),
    DestinationReached(DestinationReached),
    TurnInstruction(TurnInstruction),
    TrafficNotification(TrafficNotification),
    SuggestionPublished(Suggestion),
}

/// Event names consumers subscribe by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PositionUpdate,
    NavigationStarted,
    NavigationStopped,
    DestinationReached,
    TurnInstruction,
    TrafficNotification,
    SuggestionPublished,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PositionUpdate(_) => EventKind::PositionUpdate,
            Event::NavigationStarted(_) => EventKind::NavigationStarted,
            Event::NavigationStopped(_) => EventKind::NavigationStopped,
            Event::DestinationReached(_) => EventKind::DestinationReached,
            Event::TurnInstruction(_) => EventKind::TurnInstruction,
            Event::TrafficNotification(_) => EventKind::TrafficNotification,
            Event::SuggestionPublished(_) => EventKind::SuggestionPublished,
        }
    }
}

/// Fan-out channel shared by all components.
///
/// Publishing with no subscribers is not an error; the event is dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
            kinds: None,
        }
    }

    /// Subscribe to the given event kinds only.
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
            kinds: Some(kinds.to_vec()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of an [`EventBus`] subscription.
#[derive(Debug)]
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
    kinds: Option<Vec<EventKind>>,
}

impl EventSubscriber {
    fn wants(&self, event: &Event) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&event.kind()),
            None => true,
        }
    }

    /// Next matching event that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("[EventBus] Subscriber lagged, {} events dropped", skipped);
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain all queued matching events.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Wait for the next matching event. `None` once the bus is dropped.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[EventBus] Subscriber lagged, {} events dropped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(km: f64) -> Event {
        Event::NavigationStopped(NavigationStopped { remaining_distance_km: km })
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new(8);
        bus.publish(stopped(1.0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_filtered_subscription() {
        let bus = EventBus::new(8);
        let mut all = bus.subscribe();
        let mut only_reached = bus.subscribe_to(&[EventKind::DestinationReached]);

        bus.publish(stopped(3.0));
        bus.publish(Event::DestinationReached(DestinationReached {
            destination: "Jiujiang".to_string(),
            total_distance_km: 686.0,
            elapsed_seconds: 10,
        }));

        assert_eq!(all.drain().len(), 2);
        let reached = only_reached.drain();
        assert_eq!(reached.len(), 1);
        assert_eq!(reached[0].kind(), EventKind::DestinationReached);
    }

    #[test]
    fn test_events_preserve_order() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();
        for km in [3.0, 2.0, 1.0] {
            bus.publish(stopped(km));
        }
        let kms: Vec<f64> = sub
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Event::NavigationStopped(s) => Some(s.remaining_distance_km),
                _ => None,
            })
            .collect();
        assert_eq!(kms, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_lagged_subscriber_keeps_newest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for km in [5.0, 4.0, 3.0, 2.0] {
            bus.publish(stopped(km));
        }
        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], stopped(2.0));
    }

    #[test]
    fn test_serializes_with_event_tag() {
        let json = serde_json::to_value(stopped(12.5)).unwrap();
        assert_eq!(json["event"], "navigation_stopped");
        assert_eq!(json["remaining_distance_km"], 12.5);
    }

    #[tokio::test]
    async fn test_async_next() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe_to(&[EventKind::NavigationStopped]);
        bus.publish(stopped(7.0));
        assert_eq!(sub.next().await, Some(stopped(7.0)));
    }
}
