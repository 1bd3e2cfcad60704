use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{BillingStore, CommitReceipt, StoreError, UnitOfWork};
use crate::models::checkout::CheckoutSession;
use crate::models::common::Gateway;
use crate::models::notification::NotificationLog;
use crate::models::payment::PaymentTransaction;
use crate::models::plan::{SeatPlan, SubscriptionPlan};
use crate::models::subscription::{
    CustomerBillingInfo, Subscription, SubscriptionStatus, SubscriptionUsage, TrialActivity,
};

#[derive(Default)]
struct State {
    subscription_plans: HashMap<Uuid, SubscriptionPlan>,
    seat_plans: HashMap<Uuid, SeatPlan>,
    sessions: HashMap<Uuid, CheckoutSession>,
    subscriptions: HashMap<Uuid, Subscription>,
    transactions: Vec<PaymentTransaction>,
    trial_activities: HashMap<Uuid, TrialActivity>,
    billing_info: HashMap<Uuid, CustomerBillingInfo>,
    usage: Vec<SubscriptionUsage>,
    notifications: HashMap<String, NotificationLog>,
    employee_counts: HashMap<Uuid, u32>,
}

/// Process-local store for tests and single-instance development runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// Employee rows belong to the HR core; this stands in for them.
    pub fn set_employee_count(&self, user_id: Uuid, count: u32) -> Result<(), StoreError> {
        self.lock()?.employee_counts.insert(user_id, count);
        Ok(())
    }
}

fn check_session(state: &State, session: &CheckoutSession) -> Result<(), StoreError> {
    match state.sessions.get(&session.id) {
        None if session.version == 0 => Ok(()),
        None => Err(StoreError::NotFound(format!("checkout session {}", session.id))),
        Some(stored) if session.version != 0 && stored.version == session.version => Ok(()),
        Some(_) => Err(StoreError::conflict("checkout session", session.id)),
    }
}

fn check_subscription(state: &State, subscription: &Subscription) -> Result<(), StoreError> {
    match state.subscriptions.get(&subscription.id) {
        None if subscription.version == 0 => {
            let owned = state
                .subscriptions
                .values()
                .any(|existing| existing.user_id == subscription.user_id);
            if owned {
                Err(StoreError::conflict("subscription owner", subscription.user_id))
            } else {
                Ok(())
            }
        }
        None => Err(StoreError::NotFound(format!("subscription {}", subscription.id))),
        Some(stored)
            if subscription.version != 0
                && stored.version == subscription.version
                && stored.user_id == subscription.user_id =>
        {
            Ok(())
        }
        Some(_) => Err(StoreError::conflict("subscription", subscription.id)),
    }
}

fn check_keyed(stored: Option<u64>, version: u64, entity: &str, subscription_id: Uuid) -> Result<(), StoreError> {
    match stored {
        None if version == 0 => Ok(()),
        None => Err(StoreError::NotFound(format!("{} for subscription {}", entity, subscription_id))),
        Some(current) if version != 0 && current == version => Ok(()),
        Some(_) => Err(StoreError::conflict(entity, subscription_id)),
    }
}

fn check_transaction(state: &State, transaction: &PaymentTransaction) -> Result<(), StoreError> {
    let duplicate = state.transactions.iter().any(|existing| {
        existing.gateway == transaction.gateway
            && existing.gateway_external_id == transaction.gateway_external_id
    });
    if duplicate {
        return Err(StoreError::DuplicateTransaction {
            gateway: transaction.gateway,
            external_id: transaction.gateway_external_id.clone(),
        });
    }
    Ok(())
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn upsert_subscription_plan(&self, plan: SubscriptionPlan) -> Result<(), StoreError> {
        self.lock()?.subscription_plans.insert(plan.id, plan);
        Ok(())
    }

    async fn upsert_seat_plan(&self, plan: SeatPlan) -> Result<(), StoreError> {
        self.lock()?.seat_plans.insert(plan.id, plan);
        Ok(())
    }

    async fn get_subscription_plan(&self, id: Uuid) -> Result<Option<SubscriptionPlan>, StoreError> {
        Ok(self.lock()?.subscription_plans.get(&id).cloned())
    }

    async fn get_seat_plan(&self, id: Uuid) -> Result<Option<SeatPlan>, StoreError> {
        Ok(self.lock()?.seat_plans.get(&id).cloned())
    }

    async fn list_seat_plans(&self, subscription_plan_id: Uuid) -> Result<Vec<SeatPlan>, StoreError> {
        let mut plans: Vec<SeatPlan> = self
            .lock()?
            .seat_plans
            .values()
            .filter(|plan| plan.subscription_plan_id == subscription_plan_id)
            .cloned()
            .collect();
        plans.sort_by_key(|plan| plan.min_employees);
        Ok(plans)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<CheckoutSession>, StoreError> {
        Ok(self.lock()?.sessions.get(&id).cloned())
    }

    async fn list_open_sessions(&self) -> Result<Vec<CheckoutSession>, StoreError> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .filter(|session| !session.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_open_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<CheckoutSession>, StoreError> {
        Ok(self
            .lock()?
            .sessions
            .values()
            .filter(|session| session.user_id == user_id && !session.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn get_subscription_by_user(&self, user_id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .find(|subscription| subscription.user_id == user_id)
            .cloned())
    }

    async fn list_subscriptions(&self, statuses: &[SubscriptionStatus]) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .filter(|subscription| statuses.contains(&subscription.status))
            .cloned()
            .collect())
    }

    async fn find_transaction(
        &self,
        gateway: Gateway,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        Ok(self
            .lock()?
            .transactions
            .iter()
            .find(|txn| txn.gateway == gateway && txn.gateway_external_id == external_id)
            .cloned())
    }

    async fn list_transactions(&self, subscription_id: Uuid) -> Result<Vec<PaymentTransaction>, StoreError> {
        Ok(self
            .lock()?
            .transactions
            .iter()
            .filter(|txn| txn.subscription_id == Some(subscription_id))
            .cloned()
            .collect())
    }

    async fn get_trial_activity(&self, subscription_id: Uuid) -> Result<Option<TrialActivity>, StoreError> {
        Ok(self.lock()?.trial_activities.get(&subscription_id).cloned())
    }

    async fn get_billing_info(&self, subscription_id: Uuid) -> Result<Option<CustomerBillingInfo>, StoreError> {
        Ok(self.lock()?.billing_info.get(&subscription_id).cloned())
    }

    async fn append_usage(&self, usage: SubscriptionUsage) -> Result<(), StoreError> {
        self.lock()?.usage.push(usage);
        Ok(())
    }

    async fn list_usage(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionUsage>, StoreError> {
        Ok(self
            .lock()?
            .usage
            .iter()
            .filter(|usage| usage.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn record_notification(&self, log: NotificationLog) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let key = log.dedupe_key();
        if state.notifications.contains_key(&key) {
            return Ok(false);
        }
        state.notifications.insert(key, log);
        Ok(true)
    }

    async fn count_employees(&self, user_id: Uuid) -> Result<u32, StoreError> {
        Ok(self.lock()?.employee_counts.get(&user_id).copied().unwrap_or(0))
    }

    async fn commit(&self, work: UnitOfWork) -> Result<CommitReceipt, StoreError> {
        let mut state = self.lock()?;

        if let Some(transaction) = &work.transaction {
            check_transaction(&state, transaction)?;
        }
        if let Some(session) = &work.session {
            check_session(&state, session)?;
        }
        if let Some(subscription) = &work.subscription {
            check_subscription(&state, subscription)?;
        }
        if let Some(activity) = &work.trial_activity {
            let stored = state.trial_activities.get(&activity.subscription_id).map(|a| a.version);
            check_keyed(stored, activity.version, "trial activity", activity.subscription_id)?;
        }
        if let Some(info) = &work.billing_info {
            let stored = state.billing_info.get(&info.subscription_id).map(|i| i.version);
            check_keyed(stored, info.version, "billing info", info.subscription_id)?;
        }

        let mut receipt = CommitReceipt::default();

        if let Some(mut session) = work.session {
            session.version += 1;
            state.sessions.insert(session.id, session.clone());
            receipt.session = Some(session);
        }
        if let Some(mut subscription) = work.subscription {
            subscription.version += 1;
            state.subscriptions.insert(subscription.id, subscription.clone());
            receipt.subscription = Some(subscription);
        }
        if let Some(transaction) = work.transaction {
            state.transactions.push(transaction);
        }
        if let Some(mut activity) = work.trial_activity {
            activity.version += 1;
            state.trial_activities.insert(activity.subscription_id, activity.clone());
            receipt.trial_activity = Some(activity);
        }
        if let Some(mut info) = work.billing_info {
            info.version += 1;
            state.billing_info.insert(info.subscription_id, info.clone());
            receipt.billing_info = Some(info);
        }

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::tests::{exercise_commit_contract, exercise_notification_dedupe};

    #[tokio::test]
    async fn test_commit_contract() {
        exercise_commit_contract(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_notification_dedupe() {
        exercise_notification_dedupe(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_employee_count_defaults_to_zero() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();

        assert_eq!(store.count_employees(user_id).await.unwrap(), 0);
        store.set_employee_count(user_id, 42).unwrap();
        assert_eq!(store.count_employees(user_id).await.unwrap(), 42);
    }
}
