//! Event bus: typed events, ring buffer, resumable subscriber fan-out.
//!
//! Every mutating facade operation publishes here after its relational
//! commit. Subscribers attach with (client-id, last-seen-event-id) and
//! receive the buffered backlog in order before live events; attaching
//! below the ring horizon yields a resync signal instead.

use crate::config::EventConfig;
use crate::now_ts;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::Stream;

/// Event topics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Messages,
    Channels,
    Members,
    Agents,
    Notes,
    System,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Messages => "messages",
            Topic::Channels => "channels",
            Topic::Members => "members",
            Topic::Agents => "agents",
            Topic::Notes => "notes",
            Topic::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "messages" => Some(Topic::Messages),
            "channels" => Some(Topic::Channels),
            "members" => Some(Topic::Members),
            "agents" => Some(Topic::Agents),
            "notes" => Some(Topic::Notes),
            "system" => Some(Topic::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event subtypes, grouped by topic. Subtypes carry the plural topic
/// prefix (`messages.created`, `members.joined`); the system topic
/// names its sources directly (`project.registered`, `tool.called`).
pub mod subtype {
    pub const MESSAGES_CREATED: &str = "messages.created";

    pub const CHANNELS_CREATED: &str = "channels.created";
    pub const CHANNELS_UPDATED: &str = "channels.updated";
    pub const CHANNELS_ARCHIVED: &str = "channels.archived";

    pub const MEMBERS_JOINED: &str = "members.joined";
    pub const MEMBERS_LEFT: &str = "members.left";
    pub const MEMBERS_UPDATED: &str = "members.updated";

    pub const AGENTS_REGISTERED: &str = "agents.registered";
    pub const AGENTS_UPDATED: &str = "agents.updated";
    pub const AGENTS_DELETED: &str = "agents.deleted";

    pub const NOTES_CREATED: &str = "notes.created";
    pub const NOTES_UPDATED: &str = "notes.updated";
    pub const NOTES_TAGGED: &str = "notes.tagged";

    pub const PROJECT_REGISTERED: &str = "project.registered";
    pub const PROJECT_LINKED: &str = "project.linked";
    pub const PROJECT_UNLINKED: &str = "project.unlinked";
    pub const SESSION_CREATED: &str = "session.created";
    pub const TOOL_CALLED: &str = "tool.called";
}

/// One bus event. The payload is opaque to the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: u64,
    pub topic: Topic,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: f64,
    pub payload: Value,
}

impl Event {
    /// One line of the wire format, newline excluded.
    pub fn frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"id\":{}}}", self.id))
    }
}

/// A frame delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Event(Arc<Event>),
    /// The subscriber's cursor fell below the ring horizon, or the
    /// subscriber lagged past its queue limit. It must resync from the
    /// authoritative store and reconnect.
    ResyncRequired,
}

impl StreamFrame {
    /// Line-delimited wire encoding with explicit event ids so
    /// subscribers can resume.
    pub fn frame(&self) -> String {
        match self {
            StreamFrame::Event(event) => event.frame(),
            StreamFrame::ResyncRequired => "{\"type\":\"resync_required\"}".to_string(),
        }
    }
}

struct Ring {
    buffer: VecDeque<Arc<Event>>,
    next_id: u64,
}

/// The fan-out bus: a bounded ring of recent events plus a broadcast
/// channel for live delivery.
pub struct EventBus {
    ring: Mutex<Ring>,
    capacity: usize,
    tx: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    pub fn new(config: EventConfig) -> Arc<Self> {
        let (tx, _) = broadcast::channel(config.subscriber_queue.max(16));
        Arc::new(Self {
            ring: Mutex::new(Ring {
                buffer: VecDeque::with_capacity(config.ring_capacity.min(4096)),
                next_id: 1,
            }),
            capacity: config.ring_capacity.max(1),
            tx,
        })
    }

    /// Publish an event: assign the next monotonic id, append to the
    /// ring (dropping the oldest beyond capacity) and fan out to live
    /// subscribers. Delivery failures never propagate to the publisher.
    pub fn publish(&self, topic: Topic, kind: &str, payload: Value) -> Arc<Event> {
        let event = {
            let mut ring = self.ring.lock().expect("event ring lock");
            let event = Arc::new(Event {
                id: ring.next_id,
                topic,
                kind: kind.to_string(),
                timestamp: now_ts(),
                payload,
            });
            ring.next_id += 1;
            ring.buffer.push_back(event.clone());
            while ring.buffer.len() > self.capacity {
                ring.buffer.pop_front();
            }
            event
        };

        // No receivers is fine; the ring still records the event.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Id of the most recently published event (0 before the first).
    pub fn tail(&self) -> u64 {
        self.ring.lock().expect("event ring lock").next_id - 1
    }

    /// Id of the oldest event still buffered, if any.
    pub fn horizon(&self) -> Option<u64> {
        self.ring
            .lock()
            .expect("event ring lock")
            .buffer
            .front()
            .map(|event| event.id)
    }

    /// Attach a subscriber at `last_seen`. Buffered events with id
    /// greater than `last_seen` replay in order, then the stream goes
    /// live. If `last_seen` is older than the ring horizon the stream
    /// starts with [`StreamFrame::ResyncRequired`] and skips straight to
    /// live events. Topic filtering happens bus-side.
    pub fn subscribe(
        &self,
        client_id: &str,
        last_seen: u64,
        topics: Option<Vec<Topic>>,
    ) -> impl Stream<Item = StreamFrame> + Send + use<> {
        // Take the live receiver before snapshotting the ring so no
        // event can fall between backlog and live.
        let mut rx = self.tx.subscribe();
        let (backlog, resync) = {
            let ring = self.ring.lock().expect("event ring lock");
            let resync = match ring.buffer.front() {
                Some(oldest) => last_seen + 1 < oldest.id,
                None => last_seen + 1 < ring.next_id,
            };
            let backlog: Vec<Arc<Event>> = if resync {
                Vec::new()
            } else {
                ring.buffer
                    .iter()
                    .filter(|event| event.id > last_seen)
                    .cloned()
                    .collect()
            };
            (backlog, resync)
        };

        let client = client_id.to_string();
        let wanted = move |event: &Event| {
            topics
                .as_ref()
                .map(|topics| topics.contains(&event.topic))
                .unwrap_or(true)
        };

        async_stream::stream! {
            // Tracks the last id accounted for, so events present both
            // in the replayed backlog and in the live receiver's buffer
            // are not delivered twice.
            let mut cursor = last_seen;
            if resync {
                tracing::debug!(client = %client, last_seen, "subscriber below ring horizon");
                // Live streaming continues from the current tail; the
                // subscriber catches up from the store.
                yield StreamFrame::ResyncRequired;
            }
            for event in backlog {
                cursor = event.id;
                if wanted(&event) {
                    yield StreamFrame::Event(event);
                }
            }

            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // The receiver may have buffered events already
                        // replayed from the ring.
                        if event.id <= cursor {
                            continue;
                        }
                        cursor = event.id;
                        if wanted(&event) {
                            yield StreamFrame::Event(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        tracing::debug!(client = %client, count, "subscriber lagged, disconnecting");
                        yield StreamFrame::ResyncRequired;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use serde_json::json;

    fn bus(ring_capacity: usize) -> Arc<EventBus> {
        EventBus::new(EventConfig {
            ring_capacity,
            subscriber_queue: 16,
        })
    }

    #[test]
    fn ids_are_monotonic_across_topics() {
        let bus = bus(100);
        let first = bus.publish(Topic::Messages, subtype::MESSAGES_CREATED, json!({}));
        let second = bus.publish(Topic::Channels, subtype::CHANNELS_CREATED, json!({}));
        let third = bus.publish(Topic::Messages, subtype::MESSAGES_CREATED, json!({}));
        assert!(first.id < second.id && second.id < third.id);
        assert_eq!(bus.tail(), third.id);
    }

    #[test]
    fn ring_drops_oldest_beyond_capacity() {
        let bus = bus(4);
        for index in 0..6 {
            bus.publish(Topic::System, subtype::TOOL_CALLED, json!({ "n": index }));
        }
        assert_eq!(bus.horizon(), Some(3));
        assert_eq!(bus.tail(), 6);
    }

    #[tokio::test]
    async fn replay_covers_exactly_the_gap_then_goes_live() {
        let bus = bus(4);
        for index in 1..=6 {
            bus.publish(Topic::Messages, subtype::MESSAGES_CREATED, json!({ "n": index }));
        }

        // last_seen = 2 is exactly at the horizon boundary: e3..e6 replay.
        let mut stream = Box::pin(bus.subscribe("s1", 2, None));
        let mut replayed = Vec::new();
        for _ in 0..4 {
            match stream.next().await {
                Some(StreamFrame::Event(event)) => replayed.push(event.id),
                other => panic!("expected replayed event, got {other:?}"),
            }
        }
        assert_eq!(replayed, vec![3, 4, 5, 6]);

        let live = bus.publish(Topic::Messages, subtype::MESSAGES_CREATED, json!({ "n": 7 }));
        match stream.next().await {
            Some(StreamFrame::Event(event)) => assert_eq!(event.id, live.id),
            other => panic!("expected live event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn below_horizon_attach_resyncs_and_streams_live() {
        let bus = bus(4);
        for index in 1..=6 {
            bus.publish(Topic::Messages, subtype::MESSAGES_CREATED, json!({ "n": index }));
        }

        let mut stream = Box::pin(bus.subscribe("s2", 0, None));
        match stream.next().await {
            Some(StreamFrame::ResyncRequired) => {}
            other => panic!("expected resync, got {other:?}"),
        }

        let live = bus.publish(Topic::Messages, subtype::MESSAGES_CREATED, json!({ "n": 7 }));
        match stream.next().await {
            Some(StreamFrame::Event(event)) => {
                assert_eq!(event.id, live.id, "live streaming starts at the current tail")
            }
            other => panic!("expected live event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn topic_filters_apply_bus_side() {
        let bus = bus(100);
        bus.publish(Topic::Messages, subtype::MESSAGES_CREATED, json!({}));
        bus.publish(Topic::Channels, subtype::CHANNELS_CREATED, json!({}));
        bus.publish(Topic::Members, subtype::MEMBERS_JOINED, json!({}));

        let mut stream = Box::pin(bus.subscribe("s3", 0, Some(vec![Topic::Channels])));
        match stream.next().await {
            Some(StreamFrame::Event(event)) => {
                assert_eq!(event.topic, Topic::Channels);
            }
            other => panic!("expected channel event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagged_subscribers_are_disconnected_with_resync() {
        let bus = EventBus::new(EventConfig {
            ring_capacity: 1000,
            subscriber_queue: 16,
        });
        let mut stream = Box::pin(bus.subscribe("s4", 0, None));

        // Overflow the per-subscriber queue without polling.
        for index in 0..100 {
            bus.publish(Topic::System, subtype::TOOL_CALLED, json!({ "n": index }));
        }

        let mut saw_resync = false;
        while let Some(frame) = stream.next().await {
            if frame == StreamFrame::ResyncRequired {
                saw_resync = true;
                break;
            }
        }
        assert!(saw_resync, "overflowed subscriber must be told to resync");
        assert!(stream.next().await.is_none(), "stream ends after the resync signal");
    }

    #[test]
    fn wire_frames_carry_resume_ids() {
        let bus = bus(10);
        let event = bus.publish(
            Topic::Messages,
            subtype::MESSAGES_CREATED,
            json!({ "channel": "global:dev" }),
        );
        let frame = StreamFrame::Event(event).frame();
        let parsed: Value = serde_json::from_str(&frame).expect("frame is one JSON document");
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["topic"], "messages");
        assert_eq!(parsed["type"], "messages.created");
        assert_eq!(parsed["payload"]["channel"], "global:dev");
    }
}
