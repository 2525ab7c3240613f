//! User-facing system messages
//!
//! The session reports failures here for the UI layer to render. The queue
//! is small and drops the oldest entry when full.

use std::fmt;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;

/// Default queue capacity
pub const MESSAGE_QUEUE_CAPACITY: usize = 8;

/// Notification for the user, identified by a stable localization key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    /// The server never answered the handshake
    ConnectFailed,
    /// The server went silent while connected
    Disconnected,
    /// The server closed the session
    DisconnectedByServer,
    /// The local receive port is taken by another socket
    PortInUse { port: u16 },
    /// The local receive port could not be bound
    BindFailed { port: u16, reason: String },
}

impl SystemMessage {
    /// Localization identifier
    pub fn id(&self) -> &'static str {
        match self {
            Self::ConnectFailed => "error_connect_failed",
            Self::Disconnected => "error_disconnected",
            Self::DisconnectedByServer => "info_disconnected_by_server",
            Self::PortInUse { .. } => "error_port_in_use",
            Self::BindFailed { .. } => "error_bind_failed",
        }
    }
}

impl fmt::Display for SystemMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed => f.write_str("Could not connect to the server"),
            Self::Disconnected => f.write_str("Lost connection to the server"),
            Self::DisconnectedByServer => f.write_str("The server closed the connection"),
            Self::PortInUse { port } => write!(f, "Port {} is already in use", port),
            Self::BindFailed { port, reason } => {
                write!(f, "Could not listen on port {}: {}", port, reason)
            }
        }
    }
}

/// Bounded drop-oldest message queue
pub struct MessageQueue {
    queue: ArrayQueue<SystemMessage>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            notify: Notify::new(),
        }
    }

    /// Push a message, evicting the oldest one if the queue is full
    pub fn push(&self, message: SystemMessage) {
        tracing::info!(id = message.id(), "{}", message);
        if let Some(evicted) = self.queue.force_push(message) {
            tracing::debug!(id = evicted.id(), "Dropped stale system message");
        }
        self.notify.notify_one();
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<SystemMessage> {
        self.queue.pop()
    }

    /// Wait for the next message
    pub async fn next(&self) -> SystemMessage {
        loop {
            if let Some(message) = self.queue.pop() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(MESSAGE_QUEUE_CAPACITY)
    }
}

/// Thread-safe handle to a message queue
pub type SharedMessageQueue = Arc<MessageQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_oldest() {
        let queue = MessageQueue::new(2);
        queue.push(SystemMessage::ConnectFailed);
        queue.push(SystemMessage::Disconnected);
        queue.push(SystemMessage::PortInUse { port: 5001 });

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(SystemMessage::Disconnected));
        assert_eq!(queue.try_pop(), Some(SystemMessage::PortInUse { port: 5001 }));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = Arc::new(MessageQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };

        tokio::task::yield_now().await;
        queue.push(SystemMessage::DisconnectedByServer);

        assert_eq!(waiter.await.unwrap(), SystemMessage::DisconnectedByServer);
    }

    #[test]
    fn test_ids_are_stable() {
        assert_eq!(SystemMessage::ConnectFailed.id(), "error_connect_failed");
        assert_eq!(
            SystemMessage::BindFailed {
                port: 1,
                reason: "denied".into()
            }
            .id(),
            "error_bind_failed"
        );
    }
}
