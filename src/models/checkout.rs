use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::common::{BillingPeriod, CustomerContact, Gateway};
use crate::models::subscription::BillingInfoInput;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Initiated,
    Pending,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl CheckoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckoutStatus::Completed
                | CheckoutStatus::Failed
                | CheckoutStatus::Expired
                | CheckoutStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::Initiated => "initiated",
            CheckoutStatus::Pending => "pending",
            CheckoutStatus::Completed => "completed",
            CheckoutStatus::Failed => "failed",
            CheckoutStatus::Expired => "expired",
            CheckoutStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPurpose {
    NewSubscription,
    Trial,
    PlanChange,
    TrialConversion,
    Renewal,
}

/// One attempted purchase or plan change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
    pub purpose: CheckoutPurpose,
    /// Seat plan a plan change starts from. The change only applies while
    /// the subscription is still on it.
    #[serde(default)]
    pub source_seat_plan_id: Option<Uuid>,
    pub is_trial_checkout: bool,
    pub amount: Decimal,
    pub currency: String,
    pub status: CheckoutStatus,
    pub billing_period: Option<BillingPeriod>,
    pub gateway: Option<Gateway>,
    pub customer: Option<CustomerContact>,
    pub provider_reference: Option<String>,
    pub provider_token: Option<String>,
    pub redirect_url: Option<String>,
    pub failure_reason: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub subscription_id: Option<Uuid>,
    pub payment_transaction_id: Option<Uuid>,
    pub version: u64,
}

/// Everything a paid checkout needs before it is persisted.
#[derive(Debug, Clone)]
pub struct NewPaidCheckout {
    pub user_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
    pub purpose: CheckoutPurpose,
    /// Set on plan changes.
    pub source_seat_plan_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub gateway: Gateway,
    pub customer: CustomerContact,
}

impl CheckoutSession {
    pub fn new_trial(
        user_id: Uuid,
        subscription_plan_id: Uuid,
        seat_plan_id: Uuid,
        currency: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            subscription_plan_id,
            seat_plan_id,
            purpose: CheckoutPurpose::Trial,
            source_seat_plan_id: None,
            is_trial_checkout: true,
            amount: Decimal::ZERO,
            currency: currency.to_string(),
            status: CheckoutStatus::Initiated,
            billing_period: None,
            gateway: None,
            customer: None,
            provider_reference: None,
            provider_token: None,
            redirect_url: None,
            failure_reason: None,
            initiated_at: now,
            expires_at: now + ttl,
            completed_at: None,
            subscription_id: None,
            payment_transaction_id: None,
            version: 0,
        }
    }

    pub fn new_paid(checkout: NewPaidCheckout, ttl: Duration, now: DateTime<Utc>) -> Result<Self, String> {
        if checkout.purpose == CheckoutPurpose::Trial {
            return Err("Trial checkouts cannot carry a payment".to_string());
        }
        if checkout.amount <= Decimal::ZERO {
            return Err("Paid checkout amount must be greater than 0".to_string());
        }

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: checkout.user_id,
            subscription_plan_id: checkout.subscription_plan_id,
            seat_plan_id: checkout.seat_plan_id,
            purpose: checkout.purpose,
            source_seat_plan_id: checkout.source_seat_plan_id,
            is_trial_checkout: false,
            amount: checkout.amount,
            currency: checkout.currency,
            status: CheckoutStatus::Initiated,
            billing_period: Some(checkout.billing_period),
            gateway: Some(checkout.gateway),
            customer: Some(checkout.customer),
            provider_reference: None,
            provider_token: None,
            redirect_url: None,
            failure_reason: None,
            initiated_at: now,
            expires_at: now + ttl,
            completed_at: None,
            subscription_id: None,
            payment_transaction_id: None,
            version: 0,
        })
    }

    /// Status as observed at `now`: an open session past its expiry reads as expired.
    pub fn effective_status(&self, now: DateTime<Utc>) -> CheckoutStatus {
        if !self.status.is_terminal() && now >= self.expires_at {
            CheckoutStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_settled(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now).is_terminal()
    }

    fn ensure_open(&self) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err(format!(
                "Checkout session {} is already {}",
                self.id,
                self.status.as_str()
            ));
        }
        Ok(())
    }

    pub fn attach_invoice(
        &mut self,
        provider_reference: String,
        redirect_url: String,
        token: Option<String>,
    ) -> Result<(), String> {
        self.ensure_open()?;
        self.provider_reference = Some(provider_reference);
        self.redirect_url = Some(redirect_url);
        self.provider_token = token;
        self.status = CheckoutStatus::Pending;
        Ok(())
    }

    pub fn mark_pending(&mut self) -> Result<(), String> {
        self.ensure_open()?;
        self.status = CheckoutStatus::Pending;
        Ok(())
    }

    pub fn mark_completed(
        &mut self,
        subscription_id: Uuid,
        payment_transaction_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        self.ensure_open()?;
        self.status = CheckoutStatus::Completed;
        self.completed_at = Some(now);
        self.subscription_id = Some(subscription_id);
        self.payment_transaction_id = payment_transaction_id;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: Option<String>, now: DateTime<Utc>) -> Result<(), String> {
        self.ensure_open()?;
        self.status = CheckoutStatus::Failed;
        self.failure_reason = reason;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), String> {
        self.ensure_open()?;
        self.status = CheckoutStatus::Expired;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn to_response(&self, now: DateTime<Utc>) -> CheckoutSessionResponse {
        CheckoutSessionResponse {
            session_id: self.id,
            purpose: self.purpose,
            status: self.effective_status(now),
            amount: self.amount,
            currency: self.currency.clone(),
            is_trial_checkout: self.is_trial_checkout,
            billing_period: self.billing_period,
            gateway: self.gateway,
            redirect_url: self.redirect_url.clone(),
            token: self.provider_token.clone(),
            expires_at: self.expires_at,
            subscription_id: self.subscription_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSessionResponse {
    pub session_id: Uuid,
    pub purpose: CheckoutPurpose,
    pub status: CheckoutStatus,
    pub amount: Decimal,
    pub currency: String,
    pub is_trial_checkout: bool,
    pub billing_period: Option<BillingPeriod>,
    pub gateway: Option<Gateway>,
    pub redirect_url: Option<String>,
    pub token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub subscription_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct TrialCheckoutRequest {
    pub user_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CompleteTrialRequest {
    #[validate]
    pub billing_info: Option<BillingInfoInput>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PaidCheckoutRequest {
    pub user_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
    pub is_monthly: bool,
    pub gateway: Option<Gateway>,
    pub payment_channel: Option<String>,
    #[validate]
    pub customer: CustomerContact,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PlanChangeRequest {
    pub user_id: Uuid,
    pub new_subscription_plan_id: Option<Uuid>,
    pub new_seat_plan_id: Option<Uuid>,
    pub is_monthly: bool,
    pub gateway: Option<Gateway>,
    pub payment_channel: Option<String>,
    #[validate]
    pub customer: Option<CustomerContact>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConvertTrialRequest {
    pub user_id: Uuid,
    pub new_subscription_plan_id: Option<Uuid>,
    pub new_seat_plan_id: Option<Uuid>,
    pub is_monthly: bool,
    pub gateway: Option<Gateway>,
    pub payment_channel: Option<String>,
    #[validate]
    pub customer: CustomerContact,
    #[validate]
    pub billing_info: Option<BillingInfoInput>,
}

/// Result of pricing a plan change without touching any state.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanChangePreview {
    pub current_subscription_plan_id: Uuid,
    pub current_seat_plan_id: Uuid,
    pub target_subscription_plan_id: Uuid,
    pub target_seat_plan_id: Uuid,
    pub billing_period: BillingPeriod,
    pub current_price: Decimal,
    pub new_price: Decimal,
    pub price_difference: Decimal,
    pub is_upgrade: bool,
    pub requires_payment: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paid_checkout(amount: Decimal) -> NewPaidCheckout {
        NewPaidCheckout {
            user_id: Uuid::new_v4(),
            subscription_plan_id: Uuid::new_v4(),
            seat_plan_id: Uuid::new_v4(),
            purpose: CheckoutPurpose::NewSubscription,
            source_seat_plan_id: None,
            amount,
            currency: "IDR".to_string(),
            billing_period: BillingPeriod::Monthly,
            gateway: Gateway::Midtrans,
            customer: CustomerContact {
                name: "Budi Santoso".to_string(),
                email: "budi@example.co.id".to_string(),
                phone: None,
            },
        }
    }

    #[test]
    fn test_trial_session_is_free() {
        let now = Utc::now();
        let session = CheckoutSession::new_trial(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "IDR",
            Duration::hours(24),
            now,
        );

        assert!(session.is_trial_checkout);
        assert_eq!(session.amount, Decimal::ZERO);
        assert_eq!(session.status, CheckoutStatus::Initiated);
        assert_eq!(session.expires_at, now + Duration::hours(24));
    }

    #[test]
    fn test_paid_session_requires_positive_amount() {
        let now = Utc::now();
        assert!(CheckoutSession::new_paid(paid_checkout(Decimal::ZERO), Duration::hours(24), now).is_err());

        let session =
            CheckoutSession::new_paid(paid_checkout(Decimal::from(500_000)), Duration::hours(24), now).unwrap();
        assert!(!session.is_trial_checkout);
        assert_eq!(session.amount, Decimal::from(500_000));
    }

    #[test]
    fn test_terminal_sessions_are_immutable() {
        let now = Utc::now();
        let mut session =
            CheckoutSession::new_paid(paid_checkout(Decimal::from(500_000)), Duration::hours(24), now).unwrap();

        session.mark_failed(Some("card declined".to_string()), now).unwrap();
        assert!(session.mark_completed(Uuid::new_v4(), None, now).is_err());
        assert!(session.mark_pending().is_err());
        assert!(session
            .attach_invoice("ref".to_string(), "https://pay".to_string(), None)
            .is_err());
        assert_eq!(session.status, CheckoutStatus::Failed);
    }

    #[test]
    fn test_stale_session_reads_as_expired() {
        let now = Utc::now();
        let session =
            CheckoutSession::new_paid(paid_checkout(Decimal::from(500_000)), Duration::hours(24), now).unwrap();

        assert_eq!(session.effective_status(now), CheckoutStatus::Initiated);
        assert_eq!(
            session.effective_status(now + Duration::hours(25)),
            CheckoutStatus::Expired
        );
        assert!(session.is_settled(now + Duration::hours(25)));
    }
}
