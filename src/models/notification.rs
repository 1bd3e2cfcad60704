use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NotificationKind {
    TrialWarning { days_left: i64 },
    TrialExpired,
    RenewalDue,
    SubscriptionActivated,
}

impl NotificationKind {
    pub fn key(&self) -> String {
        match self {
            NotificationKind::TrialWarning { days_left } => format!("trial_warning_{}d", days_left),
            NotificationKind::TrialExpired => "trial_expired".to_string(),
            NotificationKind::RenewalDue => "renewal_due".to_string(),
            NotificationKind::SubscriptionActivated => "subscription_activated".to_string(),
        }
    }
}

/// Outgoing message handed to the notification worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted proof that a notification went out, at most one per
/// `(subscription_id, kind, date)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationLog {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl NotificationLog {
    pub fn new(subscription_id: Uuid, user_id: Uuid, kind: NotificationKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            user_id,
            kind: kind.key(),
            date: now.date_naive(),
            created_at: now,
        }
    }

    pub fn dedupe_key(&self) -> String {
        format!("{}:{}:{}", self.subscription_id, self.kind, self.date)
    }
}
