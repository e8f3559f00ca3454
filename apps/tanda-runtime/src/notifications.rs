use std::sync::Arc;

use async_trait::async_trait;
use tanda_core::NotificationIntent;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Turns an intent into an email, SMS or push message.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, intent: &NotificationIntent) -> Result<(), NotifyError>;
}

/// Default notifier: records the intent kind and its addressee in the log.
/// Codes and tokens are never written out.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, intent: &NotificationIntent) -> Result<(), NotifyError> {
        match intent {
            NotificationIntent::InvitationIssued { pool_id, email, .. }
            | NotificationIntent::InvitationAccepted { pool_id, email, .. }
            | NotificationIntent::InvitationRejected { pool_id, email } => {
                tracing::info!(kind = intent.kind(), pool_id, email, "notification dispatched");
            }
            NotificationIntent::ContributionConfirmed {
                pool_id,
                round,
                member_id,
                ..
            }
            | NotificationIntent::ContributionVerified {
                pool_id,
                round,
                member_id,
                ..
            } => {
                tracing::info!(kind = intent.kind(), pool_id, round, member_id, "notification dispatched");
            }
            NotificationIntent::PayoutProcessed {
                pool_id,
                round,
                recipient_member_id,
                amount_minor,
                ..
            } => {
                tracing::info!(
                    kind = intent.kind(),
                    pool_id,
                    round,
                    member_id = recipient_member_id,
                    amount_minor,
                    "notification dispatched"
                );
            }
            NotificationIntent::PoolCompleted { pool_id } => {
                tracing::info!(kind = intent.kind(), pool_id, "notification dispatched");
            }
            NotificationIntent::MfaCodeIssued { user_id, .. }
            | NotificationIntent::MfaLockedOut { user_id, .. } => {
                tracing::info!(kind = intent.kind(), user_id, "notification dispatched");
            }
        }
        Ok(())
    }
}

/// Fire-and-forget hand-off from request handlers to the delivery worker.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<NotificationIntent>,
}

impl NotificationDispatcher {
    /// Spawns the worker on the current runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<NotificationIntent>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(intent) = receiver.recv().await {
                if let Err(error) = notifier.deliver(&intent).await {
                    tracing::warn!(kind = intent.kind(), reason = %error, "notification delivery failed; dropping");
                }
            }
        });
        Self { sender }
    }

    /// Queues intents without waiting. A full queue drops the intent.
    pub fn emit(&self, intents: Vec<NotificationIntent>) {
        for intent in intents {
            let kind = intent.kind();
            if let Err(error) = self.sender.try_send(intent) {
                tracing::warn!(kind, reason = %error, "notification queue rejected intent");
            }
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: tokio::sync::Mutex<Vec<NotificationIntent>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub async fn delivered(&self) -> Vec<NotificationIntent> {
        self.delivered.lock().await.clone()
    }

    /// Polls until `predicate` matches a delivered intent or the deadline passes.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&NotificationIntent) -> bool,
    ) -> Option<NotificationIntent> {
        for _ in 0..100 {
            if let Some(found) = self.delivered().await.into_iter().find(|intent| predicate(intent)) {
                return Some(found);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        None
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, intent: &NotificationIntent) -> Result<(), NotifyError> {
        self.delivered.lock().await.push(intent.clone());
        Ok(())
    }
}
