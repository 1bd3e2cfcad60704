use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::models::notification::Notification;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the application log. Email and in-app delivery
/// live outside the billing service.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        log::info!(
            "📣 [{}] user {} subscription {}: {}",
            notification.kind.key(),
            notification.user_id,
            notification.subscription_id,
            notification.message
        );
        Ok(())
    }
}

/// Hands notifications to a background worker so delivery never runs inside
/// a request or a storage transaction.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: UnboundedSender<Notification>,
}

impl NotificationDispatcher {
    pub fn channel() -> (Self, UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (dispatcher, mut receiver) = Self::channel();

        tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                if let Err(e) = notifier.send(&notification).await {
                    log::error!(
                        "❌ Failed to deliver {} notification for subscription {}: {}",
                        notification.kind.key(),
                        notification.subscription_id,
                        e
                    );
                }
            }
            log::info!("Notification worker stopped");
        });

        dispatcher
    }

    pub fn dispatch(&self, notification: Notification) {
        let subscription_id = notification.subscription_id;
        if self.sender.send(notification).is_err() {
            log::warn!(
                "Notification queue closed; dropping notification for subscription {}",
                subscription_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::notification::NotificationKind;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        done: tokio::sync::Notify,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            self.done.notify_one();
            Ok(())
        }
    }

    fn notification() -> Notification {
        Notification {
            user_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            kind: NotificationKind::TrialExpired,
            message: "Your trial has ended".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_worker_delivers_dispatched_notifications() {
        let notifier = Arc::new(RecordingNotifier {
            sent: Mutex::new(Vec::new()),
            done: tokio::sync::Notify::new(),
        });
        let dispatcher = NotificationDispatcher::spawn(notifier.clone());

        let sent = notification();
        dispatcher.dispatch(sent.clone());
        notifier.done.notified().await;

        assert_eq!(notifier.sent.lock().unwrap().as_slice(), &[sent]);
    }

    #[tokio::test]
    async fn test_dispatch_after_close_does_not_panic() {
        let (dispatcher, receiver) = NotificationDispatcher::channel();
        drop(receiver);
        dispatcher.dispatch(notification());
    }
}
