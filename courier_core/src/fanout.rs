//! Pushing completed updates to live connections.
//!
//! A [`Hub`] lives in every process that holds browser connections. Other processes reach it
//! through the `websockets` queue: [`Notifier::publish`] produces a [`NotificationMessage`] and the
//! [`FanoutHandler`] consuming that queue broadcasts it locally.

use crate::envelope::Delivery;
use crate::handler::{Handler, PayloadType};
use crate::payload::Payload;
use crate::pipeline::Channels;
use crate::queue::QueueName;
use async_trait::async_trait;
use courier_derive::HandlerName;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Live-page topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// A title page.
    App,
    /// A bundle page.
    Package,
    /// An account page.
    Player,
    /// A collective page.
    Group,
    /// The recent-changes feed.
    Changes,
    /// The queue monitor.
    Queues,
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::App => "app",
            Topic::Package => "package",
            Topic::Player => "player",
            Topic::Group => "group",
            Topic::Changes => "changes",
            Topic::Queues => "queues",
        }
    }

    /// Whether `data` has a shape subscribers of this topic understand.
    pub fn accepts(&self, data: &NotificationData) -> bool {
        match (self, data) {
            (Topic::App | Topic::Package | Topic::Group, NotificationData::Id { .. }) => true,
            (Topic::Player, NotificationData::Key { .. } | NotificationData::Id { .. }) => true,
            (Topic::Changes | Topic::Queues, NotificationData::Batch { .. }) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The frame pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationData {
    /// `{"id": 440}`
    Id {
        /// Numeric entity id.
        id: u64,
    },
    /// `{"id": "76561197960287930"}`
    Key {
        /// Entity id too large for browser numbers.
        id: String,
    },
    /// `{"batch": [[...], ...]}`
    Batch {
        /// Rows of heterogeneous values.
        batch: Vec<Vec<serde_json::Value>>,
    },
}

/// Payload of the `websockets` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Destination topic.
    pub topic: Topic,
    /// Frame to push.
    pub data: NotificationData,
}

/// Returned by a connection that can no longer be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// A live browser connection.
pub trait LiveConnection: Send + Sync {
    /// Writes one text frame.
    fn send(&self, frame: &str) -> Result<(), ConnectionClosed>;
}

type Subscribers = HashMap<Topic, HashMap<Uuid, Arc<dyn LiveConnection>>>;

/// Registry of live connections by topic.
#[derive(Default)]
pub struct Hub {
    subscribers: RwLock<Subscribers>,
}

impl Hub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `connection` to `topic`. The returned id unsubscribes it.
    pub fn subscribe(&self, topic: Topic, connection: Arc<dyn LiveConnection>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic)
            .or_default()
            .insert(id, connection);
        id
    }

    /// Removes a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, topic: Topic, id: Uuid) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&topic)
            .is_some_and(|connections| connections.remove(&id).is_some())
    }

    /// Number of live connections subscribed to `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&topic)
            .map_or(0, HashMap::len)
    }

    /// Pushes `data` to every subscriber of `topic` and returns how many received it.
    ///
    /// Connections whose write fails are removed.
    pub fn broadcast(&self, topic: Topic, data: &NotificationData) -> usize {
        let frame = match serde_json::to_string(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode notification for '{}': {}", topic, e);
                return 0;
            }
        };

        let connections: Vec<(Uuid, Arc<dyn LiveConnection>)> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&topic)
            .map(|connections| {
                connections
                    .iter()
                    .map(|(id, c)| (*id, Arc::clone(c)))
                    .collect()
            })
            .unwrap_or_default();

        let mut dead = Vec::new();
        for (id, connection) in &connections {
            if connection.send(&frame).is_err() {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            debug!(
                "Pruning {} closed connection(s) from topic '{}'",
                dead.len(),
                topic
            );
            let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(connections) = subscribers.get_mut(&topic) {
                for id in &dead {
                    connections.remove(id);
                }
            }
        }

        connections.len() - dead.len()
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<Topic, usize> = subscribers
            .iter()
            .map(|(topic, connections)| (*topic, connections.len()))
            .collect();
        f.debug_struct("Hub").field("subscribers", &counts).finish()
    }
}

/// Publishes notifications from anywhere in the pipeline.
///
/// Publishing is best effort: failures are logged and never affect the caller.
#[derive(Clone)]
pub enum Notifier {
    /// Route through the `websockets` queue to whichever processes hold connections.
    Queue(Channels),
    /// Broadcast directly on a hub in this process.
    Local(Arc<Hub>),
    /// Drop notifications.
    Disabled,
}

impl Notifier {
    /// Publishes `data` on `topic`.
    pub async fn publish(&self, topic: Topic, data: NotificationData) {
        if !topic.accepts(&data) {
            warn!("Dropping notification with unexpected shape for '{}'", topic);
            return;
        }
        match self {
            Notifier::Queue(channels) => {
                let message = Payload::Notification(NotificationMessage { topic, data });
                if let Err(e) = channels.produce(QueueName::Websockets, message).await {
                    warn!("Failed to publish notification for '{}': {}", topic, e);
                }
            }
            Notifier::Local(hub) => {
                hub.broadcast(topic, &data);
            }
            Notifier::Disabled => {}
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notifier::Queue(_) => f.write_str("Notifier::Queue"),
            Notifier::Local(hub) => f.debug_tuple("Notifier::Local").field(hub).finish(),
            Notifier::Disabled => f.write_str("Notifier::Disabled"),
        }
    }
}

/// Consumes the `websockets` queue and broadcasts on the local hub.
///
/// Always acks: a notification nobody received is not worth retrying.
#[derive(Debug, HandlerName)]
pub struct FanoutHandler {
    hub: Arc<Hub>,
}

impl FanoutHandler {
    /// Creates a handler broadcasting on `hub`.
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Handler for FanoutHandler {
    async fn handle(&self, batch: &[Delivery]) {
        for delivery in batch {
            match delivery.payload() {
                Payload::Notification(message) => {
                    let delivered = self.hub.broadcast(message.topic, &message.data);
                    debug!(
                        "Delivered notification on '{}' to {} connection(s)",
                        message.topic, delivered
                    );
                    delivery.ack();
                }
                other => {
                    delivery.fail(format!(
                        "unexpected {} payload on the notification queue",
                        other.payload_type()
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Decision, Envelope};
    use crate::handler::HandlerName;
    use crate::payload::EntityMessage;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingConnection {
        frames: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl LiveConnection for RecordingConnection {
        fn send(&self, frame: &str) -> Result<(), ConnectionClosed> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConnectionClosed);
            }
            self.frames.lock().unwrap().push(frame.to_string());
            Ok(())
        }
    }

    #[test]
    fn notification_shapes() {
        assert_eq!(
            serde_json::to_value(NotificationData::Id { id: 440 }).unwrap(),
            json!({"id": 440})
        );
        assert_eq!(
            serde_json::from_value::<NotificationData>(json!({"id": "76561197960287930"}))
                .unwrap(),
            NotificationData::Key {
                id: "76561197960287930".to_string()
            }
        );
        assert_eq!(
            serde_json::from_value::<NotificationData>(json!({"batch": [[5, "x"]]})).unwrap(),
            NotificationData::Batch {
                batch: vec![vec![json!(5), json!("x")]]
            }
        );
    }

    #[test]
    fn topics_only_accept_their_shapes() {
        assert!(Topic::App.accepts(&NotificationData::Id { id: 1 }));
        assert!(!Topic::App.accepts(&NotificationData::Batch { batch: vec![] }));
        assert!(Topic::Player.accepts(&NotificationData::Key { id: "1".into() }));
        assert!(Topic::Changes.accepts(&NotificationData::Batch { batch: vec![] }));
        assert!(!Topic::Changes.accepts(&NotificationData::Id { id: 1 }));
    }

    #[test]
    fn broadcast_reaches_every_subscriber_of_the_topic() {
        let hub = Hub::new();
        let a = Arc::new(RecordingConnection::default());
        let b = Arc::new(RecordingConnection::default());
        let other = Arc::new(RecordingConnection::default());
        hub.subscribe(Topic::App, a.clone());
        hub.subscribe(Topic::App, b.clone());
        hub.subscribe(Topic::Package, other.clone());

        let delivered = hub.broadcast(Topic::App, &NotificationData::Id { id: 440 });

        assert_eq!(delivered, 2);
        assert_eq!(*a.frames.lock().unwrap(), vec![r#"{"id":440}"#.to_string()]);
        assert_eq!(b.frames.lock().unwrap().len(), 1);
        assert!(other.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn broadcast_prunes_closed_connections() {
        let hub = Hub::new();
        let alive = Arc::new(RecordingConnection::default());
        let dead = Arc::new(RecordingConnection::default());
        dead.closed.store(true, Ordering::SeqCst);
        hub.subscribe(Topic::Changes, alive.clone());
        hub.subscribe(Topic::Changes, dead);

        let data = NotificationData::Batch { batch: vec![] };
        assert_eq!(hub.broadcast(Topic::Changes, &data), 1);
        assert_eq!(hub.subscriber_count(Topic::Changes), 1);
        assert_eq!(hub.broadcast(Topic::Changes, &data), 1);
        assert_eq!(alive.frames.lock().unwrap().len(), 2);
    }

    #[test]
    fn unsubscribe_removes_the_connection() {
        let hub = Hub::new();
        let id = hub.subscribe(Topic::Group, Arc::new(RecordingConnection::default()));
        assert!(hub.unsubscribe(Topic::Group, id));
        assert!(!hub.unsubscribe(Topic::Group, id));
        assert_eq!(hub.subscriber_count(Topic::Group), 0);
    }

    #[tokio::test]
    async fn fanout_handler_broadcasts_and_acks() {
        let hub = Arc::new(Hub::new());
        let connection = Arc::new(RecordingConnection::default());
        hub.subscribe(Topic::App, connection.clone());
        let handler = FanoutHandler::new(hub);

        let notification = Delivery::new(
            Envelope::new(
                Payload::Notification(NotificationMessage {
                    topic: Topic::App,
                    data: NotificationData::Id { id: 440 },
                }),
                QueueName::Websockets,
            ),
            QueueName::Websockets,
            1,
        );
        let stray = Delivery::new(
            Envelope::new(Payload::App(EntityMessage::new(1)), QueueName::App),
            QueueName::Websockets,
            2,
        );
        handler.handle(&[notification.clone(), stray.clone()]).await;

        assert_eq!(notification.decision(), Some(Decision::Ack));
        assert!(matches!(stray.decision(), Some(Decision::Fail { .. })));
        assert_eq!(connection.frames.lock().unwrap().len(), 1);
        assert_eq!(handler.handler_name(), "handler:fanout");
    }

    #[tokio::test]
    async fn local_notifier_drops_mismatched_shapes() {
        let hub = Arc::new(Hub::new());
        let connection = Arc::new(RecordingConnection::default());
        hub.subscribe(Topic::Changes, connection.clone());
        let notifier = Notifier::Local(hub);

        notifier
            .publish(Topic::Changes, NotificationData::Id { id: 1 })
            .await;
        assert!(connection.frames.lock().unwrap().is_empty());

        notifier
            .publish(Topic::Changes, NotificationData::Batch { batch: vec![] })
            .await;
        assert_eq!(connection.frames.lock().unwrap().len(), 1);
    }
}
