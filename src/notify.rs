use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ActorId;

const CHANNEL_CAPACITY: usize = 256;

/// A schedule change announced to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub group_id: Ulid,
    pub group_name: String,
    /// Actor who made the change; never among `recipients`.
    pub initiator: ActorId,
    pub recipients: Vec<ActorId>,
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier unavailable: {0}")]
    Unavailable(String),
}

/// Fire-and-forget delivery. Failures are reported to the caller, which logs
/// and moves on; they never undo the change being announced.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_group(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Broadcast hub with one inbox per actor.
pub struct NotifyHub {
    channels: DashMap<ActorId, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to an actor's inbox. Creates the channel if needed.
    pub fn subscribe(&self, actor: ActorId) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(actor)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send to one inbox. No-op if nobody is listening.
    pub fn send(&self, actor: ActorId, notification: &Notification) {
        if let Some(sender) = self.channels.get(&actor) {
            let _ = sender.send(notification.clone());
        }
    }

    /// Drop an inbox once its last listener has gone.
    pub fn remove_if_idle(&self, actor: &ActorId) {
        self.channels
            .remove_if(actor, |_, sender| sender.receiver_count() == 0);
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify_group(&self, notification: Notification) -> Result<(), NotifyError> {
        for recipient in &notification.recipients {
            self.send(*recipient, &notification);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(recipients: Vec<ActorId>) -> Notification {
        Notification {
            group_id: Ulid::new(),
            group_name: "biology".into(),
            initiator: Ulid::new(),
            recipients,
            subject: "A new schedule has been created".into(),
            message: "Schedule 'lab' was created".into(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let actor = Ulid::new();
        let mut rx = hub.subscribe(actor);

        let n = note(vec![actor]);
        hub.notify_group(n.clone()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, n);
    }

    #[tokio::test]
    async fn only_recipients_receive() {
        let hub = NotifyHub::new();
        let listener = Ulid::new();
        let bystander = Ulid::new();
        let mut rx_listener = hub.subscribe(listener);
        let mut rx_bystander = hub.subscribe(bystander);

        hub.notify_group(note(vec![listener])).await.unwrap();

        assert!(rx_listener.recv().await.is_ok());
        assert!(rx_bystander.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.notify_group(note(vec![Ulid::new()])).await.unwrap();
    }

    #[tokio::test]
    async fn idle_inbox_is_removed() {
        let hub = NotifyHub::new();
        let actor = Ulid::new();
        let rx = hub.subscribe(actor);
        hub.remove_if_idle(&actor);
        assert!(hub.channels.contains_key(&actor));
        drop(rx);
        hub.remove_if_idle(&actor);
        assert!(!hub.channels.contains_key(&actor));
    }
}
