use courier_core::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// A live connection backed by an unbounded channel.
///
/// The connection counts as closed once the receiving half is dropped.
#[derive(Debug)]
pub struct ChannelConnection {
    sender: UnboundedSender<String>,
}

impl ChannelConnection {
    /// Creates a connection and the receiver its frames arrive on.
    pub fn pair() -> (Arc<Self>, UnboundedReceiver<String>) {
        let (sender, receiver) = unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl LiveConnection for ChannelConnection {
    fn send(&self, frame: &str) -> Result<(), ConnectionClosed> {
        self.sender
            .send(frame.to_string())
            .map_err(|_| ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_receivers_close_the_connection() {
        let hub = Hub::new();
        let (open, mut frames) = ChannelConnection::pair();
        let (closed, receiver) = ChannelConnection::pair();
        drop(receiver);
        hub.subscribe(Topic::Player, open);
        hub.subscribe(Topic::Player, closed);

        let delivered = hub.broadcast(
            Topic::Player,
            &NotificationData::Key {
                id: "76561197960287930".to_string(),
            },
        );

        assert_eq!(delivered, 1);
        assert_eq!(hub.subscriber_count(Topic::Player), 1);
        assert_eq!(
            frames.recv().await.unwrap(),
            r#"{"id":"76561197960287930"}"#
        );
    }
}
