use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::common::BillingPeriod;
use crate::models::plan::SeatPlan;
use crate::models::subscription::{Subscription, SubscriptionStatus};

pub const SEAT_PLAN_NOT_IN_PLAN: &str = "seat plan does not belong to current subscription plan";

/// Subscription transitions that are not driven by a payment.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionLifecycleManager {
    trial_days: i64,
}

impl SubscriptionLifecycleManager {
    pub fn new(trial_days: i64) -> Self {
        Self { trial_days }
    }

    pub fn start_trial(&self, subscription: &mut Subscription, now: DateTime<Utc>) -> Result<(), BillingError> {
        subscription
            .start_trial(self.trial_days, now)
            .map_err(BillingError::Validation)
    }

    /// Builds the subscription a trial checkout completes into. A user owns
    /// at most one live subscription; an expired or cancelled record is
    /// reused so the trial-used flag follows the user.
    pub fn new_trial_subscription(
        &self,
        existing: Option<Subscription>,
        user_id: Uuid,
        subscription_plan_id: Uuid,
        seat_plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Subscription, BillingError> {
        let mut subscription = match existing {
            None => Subscription::new(user_id, subscription_plan_id, seat_plan_id, now),
            Some(existing) if existing.is_trial_used => {
                return Err(BillingError::Validation(
                    "Trial has already been used for this account".to_string(),
                ));
            }
            Some(existing) if !Self::is_replaceable(&existing) => {
                return Err(BillingError::Validation(format!(
                    "User already has a {} subscription",
                    existing.status.as_str()
                )));
            }
            Some(mut existing) => {
                existing.switch_plan(subscription_plan_id, seat_plan_id, now);
                existing
            }
        };

        self.start_trial(&mut subscription, now)?;
        Ok(subscription)
    }

    /// Whether a stored subscription may be replaced by a new purchase.
    pub fn is_replaceable(subscription: &Subscription) -> bool {
        subscription.status.is_terminal() || subscription.status == SubscriptionStatus::Inactive
    }

    pub fn is_in_trial(&self, subscription: &Subscription, now: DateTime<Utc>) -> bool {
        subscription.is_in_trial(now)
    }

    pub fn is_trial_expired(&self, subscription: &Subscription, now: DateTime<Utc>) -> bool {
        subscription.is_trial_expired(now)
    }

    pub fn remaining_trial_days(&self, subscription: &Subscription, now: DateTime<Utc>) -> i64 {
        subscription.remaining_trial_days(now)
    }

    pub fn activate(&self, subscription: &mut Subscription, period: BillingPeriod, now: DateTime<Utc>) {
        subscription.activate(period, now);
    }

    pub fn renew(&self, subscription: &mut Subscription, period: BillingPeriod, now: DateTime<Utc>) {
        subscription.extend(period, now);
    }

    /// Returns `true` when the trial was over and the subscription is now expired.
    pub fn expire_trial(&self, subscription: &mut Subscription, now: DateTime<Utc>) -> bool {
        if !subscription.is_trial_expired(now) {
            return false;
        }
        subscription.expire(now);
        true
    }

    pub fn is_due_for_renewal(&self, subscription: &Subscription, now: DateTime<Utc>) -> bool {
        subscription.is_due_for_renewal(now)
    }

    pub fn validate_seat_plan_membership(
        &self,
        seat_plan: &SeatPlan,
        subscription_plan_id: Uuid,
    ) -> Result<(), BillingError> {
        if seat_plan.subscription_plan_id != subscription_plan_id {
            return Err(BillingError::Validation(SEAT_PLAN_NOT_IN_PLAN.to_string()));
        }
        Ok(())
    }

    pub fn validate_downgrade(&self, employee_count: u32, target: &SeatPlan) -> Result<(), BillingError> {
        if !target.covers(employee_count) {
            return Err(BillingError::Validation(format!(
                "Cannot downgrade to {}: {} employees exceed its limit of {}",
                target.name, employee_count, target.max_employees
            )));
        }
        Ok(())
    }

    pub fn apply_plan_change(
        &self,
        subscription: &mut Subscription,
        subscription_plan_id: Uuid,
        seat_plan_id: Uuid,
        now: DateTime<Utc>,
    ) {
        subscription.switch_plan(subscription_plan_id, seat_plan_id, now);
    }
}
