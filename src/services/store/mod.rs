pub mod memory;
pub mod surreal;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::checkout::CheckoutSession;
use crate::models::common::Gateway;
use crate::models::notification::NotificationLog;
use crate::models::payment::PaymentTransaction;
use crate::models::plan::{SeatPlan, SubscriptionPlan};
use crate::models::subscription::{
    CustomerBillingInfo, Subscription, SubscriptionStatus, SubscriptionUsage, TrialActivity,
};

pub use self::memory::MemoryStore;
pub use self::surreal::SurrealStore;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("payment transaction {external_id} from {gateway} is already recorded")]
    DuplicateTransaction { gateway: Gateway, external_id: String },

    #[error("{entity} {id} was modified concurrently")]
    Conflict { entity: String, id: String },

    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn conflict(entity: &str, id: impl ToString) -> Self {
        StoreError::Conflict {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

/// Writes that must land together or not at all.
///
/// Every record except the transaction is version checked: `version == 0`
/// inserts a new record, anything else must match the stored version and
/// is bumped on write. A subscription insert also fails if the user
/// already owns one. Trial activity and billing info are keyed by
/// subscription. The transaction is insert-only and unique per
/// `(gateway, external id)`.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub session: Option<CheckoutSession>,
    pub subscription: Option<Subscription>,
    pub transaction: Option<PaymentTransaction>,
    pub trial_activity: Option<TrialActivity>,
    pub billing_info: Option<CustomerBillingInfo>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, session: CheckoutSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    pub fn transaction(mut self, transaction: PaymentTransaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn trial_activity(mut self, activity: TrialActivity) -> Self {
        self.trial_activity = Some(activity);
        self
    }

    pub fn billing_info(mut self, info: CustomerBillingInfo) -> Self {
        self.billing_info = Some(info);
        self
    }
}

/// Records as stored by a commit, carrying their new versions.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub session: Option<CheckoutSession>,
    pub subscription: Option<Subscription>,
    pub trial_activity: Option<TrialActivity>,
    pub billing_info: Option<CustomerBillingInfo>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn upsert_subscription_plan(&self, plan: SubscriptionPlan) -> Result<(), StoreError>;
    async fn upsert_seat_plan(&self, plan: SeatPlan) -> Result<(), StoreError>;
    async fn get_subscription_plan(&self, id: Uuid) -> Result<Option<SubscriptionPlan>, StoreError>;
    async fn get_seat_plan(&self, id: Uuid) -> Result<Option<SeatPlan>, StoreError>;
    async fn list_seat_plans(&self, subscription_plan_id: Uuid) -> Result<Vec<SeatPlan>, StoreError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<CheckoutSession>, StoreError>;
    /// Sessions whose stored status is not terminal.
    async fn list_open_sessions(&self) -> Result<Vec<CheckoutSession>, StoreError>;
    async fn list_open_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<CheckoutSession>, StoreError>;

    async fn get_subscription_by_user(&self, user_id: Uuid) -> Result<Option<Subscription>, StoreError>;
    async fn list_subscriptions(&self, statuses: &[SubscriptionStatus]) -> Result<Vec<Subscription>, StoreError>;

    async fn find_transaction(
        &self,
        gateway: Gateway,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError>;
    async fn list_transactions(&self, subscription_id: Uuid) -> Result<Vec<PaymentTransaction>, StoreError>;

    async fn get_trial_activity(&self, subscription_id: Uuid) -> Result<Option<TrialActivity>, StoreError>;
    async fn get_billing_info(&self, subscription_id: Uuid) -> Result<Option<CustomerBillingInfo>, StoreError>;

    async fn append_usage(&self, usage: SubscriptionUsage) -> Result<(), StoreError>;
    async fn list_usage(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionUsage>, StoreError>;

    /// Returns `false` when an entry with the same dedupe key already exists.
    async fn record_notification(&self, log: NotificationLog) -> Result<bool, StoreError>;

    /// Employees administered by `user_id`, read from the HR core tables.
    async fn count_employees(&self, user_id: Uuid) -> Result<u32, StoreError>;

    async fn commit(&self, work: UnitOfWork) -> Result<CommitReceipt, StoreError>;
}

pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn BillingStore>> {
    if config.url.starts_with("memory://") {
        log::info!("Using in-memory billing store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = SurrealStore::connect(config).await?;
    log::info!("Connected to SurrealDB at {}", config.url);
    Ok(Arc::new(store))
}
