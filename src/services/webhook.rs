use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::checkout::{CheckoutPurpose, CheckoutSession, CheckoutStatus};
use crate::models::common::BillingPeriod;
use crate::models::notification::{Notification, NotificationKind};
use crate::models::payment::{ChargeDetails, PaymentTransaction};
use crate::models::plan::SeatPlan;
use crate::models::subscription::{CustomerBillingInfo, Subscription, SubscriptionStatus};
use crate::services::gateway::{PaymentEvent, PaymentEventKind};
use crate::services::notification::NotificationDispatcher;
use crate::services::store::{BillingStore, StoreError, UnitOfWork};
use crate::services::subscription::SubscriptionLifecycleManager;

const MAX_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Completed {
        subscription_id: Uuid,
        transaction_id: Uuid,
    },
    MarkedPending,
    MarkedExpired,
    MarkedFailed,
    AlreadyProcessed,
    /// Money arrived for a session the subscription can no longer honour.
    RequiresReconciliation {
        reason: String,
    },
}

/// Period a payment buys. Sessions carry it explicitly; older sessions
/// without one fall back to comparing the amount with the monthly price.
pub fn billing_period_for_payment(session: &CheckoutSession, seat_plan: &SeatPlan) -> BillingPeriod {
    session.billing_period.unwrap_or_else(|| {
        if session.amount == seat_plan.price_per_month {
            BillingPeriod::Monthly
        } else {
            BillingPeriod::Yearly
        }
    })
}

/// Why a paid session can no longer be applied to the user's current
/// subscription, if it cannot.
fn unsettleable_reason(session: &CheckoutSession, existing: Option<&Subscription>) -> Option<String> {
    match (session.purpose, existing) {
        (CheckoutPurpose::NewSubscription | CheckoutPurpose::TrialConversion, Some(subscription))
            if !matches!(subscription.status, SubscriptionStatus::Trial | SubscriptionStatus::Inactive)
                && !subscription.status.is_terminal() =>
        {
            Some(format!(
                "subscription {} is already {}",
                subscription.id,
                subscription.status.as_str()
            ))
        }
        (CheckoutPurpose::PlanChange, None) => Some(format!("user {} has no subscription to change", session.user_id)),
        (CheckoutPurpose::PlanChange, Some(subscription)) if subscription.status != SubscriptionStatus::Active => {
            Some(format!(
                "subscription {} is {}, not active",
                subscription.id,
                subscription.status.as_str()
            ))
        }
        (CheckoutPurpose::PlanChange, Some(subscription)) => match session.source_seat_plan_id {
            Some(source) if source != subscription.seat_plan_id => Some(format!(
                "subscription {} is no longer on seat plan {}",
                subscription.id, source
            )),
            _ => None,
        },
        _ => None,
    }
}

/// Applies verified gateway events to checkout sessions, subscriptions and
/// payment transactions. Safe under duplicate and concurrent delivery.
#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn BillingStore>,
    lifecycle: SubscriptionLifecycleManager,
    notifications: NotificationDispatcher,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        lifecycle: SubscriptionLifecycleManager,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            lifecycle,
            notifications,
        }
    }

    pub async fn process(&self, event: &PaymentEvent) -> Result<WebhookOutcome, BillingError> {
        self.process_at(event, Utc::now()).await
    }

    /// A version conflict means another writer got there first; re-reading
    /// then finds the session settled. Running out of attempts is reported
    /// as unavailable so the gateway redelivers.
    pub async fn process_at(&self, event: &PaymentEvent, now: DateTime<Utc>) -> Result<WebhookOutcome, BillingError> {
        let mut attempt = 1;
        loop {
            match self.apply(event, now).await {
                Err(BillingError::Conflict(reason)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    log::warn!(
                        "Retrying {} event for session {} after conflict: {}",
                        event.gateway,
                        event.session_id,
                        reason
                    );
                    attempt += 1;
                }
                Err(BillingError::Conflict(reason)) => {
                    log::error!(
                        "Giving up on {} event for session {} after {} attempts: {}",
                        event.gateway,
                        event.session_id,
                        attempt,
                        reason
                    );
                    return Err(BillingError::Unavailable(reason));
                }
                result => return result,
            }
        }
    }

    async fn apply(&self, event: &PaymentEvent, now: DateTime<Utc>) -> Result<WebhookOutcome, BillingError> {
        let session = self
            .store
            .get_session(event.session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("checkout session {}", event.session_id)))?;

        if session.is_settled(now) {
            if event.kind == PaymentEventKind::Paid && session.status != CheckoutStatus::Completed {
                log::warn!(
                    "Payment reported by {} for session {} which is already {}; manual reconciliation needed",
                    event.gateway,
                    session.id,
                    session.effective_status(now).as_str()
                );
            } else {
                log::info!("Session {} already settled, ignoring {:?} event", session.id, event.kind);
            }
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        if session.gateway != Some(event.gateway) {
            return Err(BillingError::Validation(format!(
                "Checkout session {} was not issued through {}",
                session.id, event.gateway
            )));
        }

        match event.kind {
            PaymentEventKind::Paid => self.apply_paid(session, event, now).await,
            PaymentEventKind::Pending => self.apply_pending(session).await,
            PaymentEventKind::Expired => self.apply_expired(session, now).await,
            PaymentEventKind::Failed => self.apply_failed(session, event, now).await,
        }
    }

    async fn apply_paid(
        &self,
        mut session: CheckoutSession,
        event: &PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let external_id = event
            .gateway_transaction_id
            .clone()
            .ok_or_else(|| BillingError::MalformedPayload("paid event without a transaction id".to_string()))?;

        if self.store.find_transaction(event.gateway, &external_id).await?.is_some() {
            log::info!("Transaction {} from {} already recorded", external_id, event.gateway);
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let seat_plan = self
            .store
            .get_seat_plan(session.seat_plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("seat plan {}", session.seat_plan_id)))?;
        let period = billing_period_for_payment(&session, &seat_plan);

        let amount = match event.amount_received {
            Some(received) => {
                if received != session.amount {
                    log::warn!(
                        "Session {} expected {} {} but {} reported {}",
                        session.id,
                        session.amount,
                        session.currency,
                        event.gateway,
                        received
                    );
                }
                received
            }
            None => session.amount,
        };

        let existing = self.store.get_subscription_by_user(session.user_id).await?;
        if let Some(reason) = unsettleable_reason(&session, existing.as_ref()) {
            return self.hold_for_reconciliation(session, existing, event, reason, now).await;
        }
        let mut trial_activity = None;

        let subscription = match session.purpose {
            CheckoutPurpose::Trial => {
                return Err(BillingError::Validation(format!(
                    "Trial checkout {} cannot be paid",
                    session.id
                )));
            }
            CheckoutPurpose::PlanChange => {
                let mut subscription = existing.ok_or_else(|| {
                    BillingError::NotFound(format!("subscription for user {}", session.user_id))
                })?;
                self.lifecycle.apply_plan_change(
                    &mut subscription,
                    session.subscription_plan_id,
                    session.seat_plan_id,
                    now,
                );
                subscription
            }
            CheckoutPurpose::Renewal => {
                let mut subscription = existing.ok_or_else(|| {
                    BillingError::NotFound(format!("subscription for user {}", session.user_id))
                })?;
                self.lifecycle.renew(&mut subscription, period, now);
                subscription
            }
            CheckoutPurpose::NewSubscription | CheckoutPurpose::TrialConversion => {
                let mut subscription = existing.unwrap_or_else(|| {
                    Subscription::new(session.user_id, session.subscription_plan_id, session.seat_plan_id, now)
                });
                let was_trial = subscription.status == SubscriptionStatus::Trial;

                self.lifecycle.apply_plan_change(
                    &mut subscription,
                    session.subscription_plan_id,
                    session.seat_plan_id,
                    now,
                );
                self.lifecycle.activate(&mut subscription, period, now);

                if was_trial {
                    if let Some(mut activity) = self.store.get_trial_activity(subscription.id).await? {
                        activity.mark_converted(now);
                        trial_activity = Some(activity);
                    }
                }
                subscription
            }
        };

        let billing_info = match (&session.customer, self.store.get_billing_info(subscription.id).await?) {
            (Some(contact), None) => Some(CustomerBillingInfo::from_contact(subscription.id, contact, now)),
            _ => None,
        };

        let transaction = PaymentTransaction::paid(
            &session,
            subscription.id,
            ChargeDetails {
                gateway: event.gateway,
                gateway_external_id: external_id,
                amount,
                payment_method: event.payment_method.clone(),
                paid_at: event.paid_at,
            },
            now,
        );
        let transaction_id = transaction.id;
        let subscription_id = subscription.id;

        session
            .mark_completed(subscription_id, Some(transaction_id), now)
            .map_err(BillingError::Conflict)?;

        let mut work = UnitOfWork::new()
            .session(session.clone())
            .subscription(subscription.clone())
            .transaction(transaction);
        work.trial_activity = trial_activity;
        work.billing_info = billing_info;

        match self.store.commit(work).await {
            Ok(_) => {}
            Err(StoreError::DuplicateTransaction { gateway, external_id }) => {
                log::info!("Concurrent delivery of {} transaction {} lost the race", gateway, external_id);
                return Ok(WebhookOutcome::AlreadyProcessed);
            }
            Err(e) => return Err(e.into()),
        }

        log::info!(
            "✅ Session {} completed: subscription {} {} via {} ({} {})",
            session.id,
            subscription_id,
            match session.purpose {
                CheckoutPurpose::Renewal => "renewed",
                CheckoutPurpose::PlanChange => "changed plan",
                _ => "activated",
            },
            event.gateway,
            amount,
            session.currency
        );

        self.notifications.dispatch(Notification {
            user_id: session.user_id,
            subscription_id,
            kind: NotificationKind::SubscriptionActivated,
            message: format!(
                "Payment of {} {} received. Your subscription is active until {}.",
                amount,
                session.currency,
                subscription
                    .subscription_end_date
                    .map(|end| end.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "further notice".to_string())
            ),
            created_at: now,
        });

        Ok(WebhookOutcome::Completed {
            subscription_id,
            transaction_id,
        })
    }

    /// Fails the session instead of completing it. The subscription is
    /// written back unchanged, so a concurrent change to it fails this
    /// commit and the event is re-evaluated.
    async fn hold_for_reconciliation(
        &self,
        mut session: CheckoutSession,
        existing: Option<Subscription>,
        event: &PaymentEvent,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let reason = format!("reconciliation required: {}", reason);
        session
            .mark_failed(Some(reason.clone()), now)
            .map_err(BillingError::Conflict)?;
        let session_id = session.id;

        let mut work = UnitOfWork::new().session(session);
        if let Some(subscription) = existing {
            work = work.subscription(subscription);
        }
        self.store.commit(work).await?;

        log::warn!(
            "⚠️ Payment {} from {} for session {} not applied, {}",
            event.gateway_transaction_id.as_deref().unwrap_or("-"),
            event.gateway,
            session_id,
            reason
        );
        Ok(WebhookOutcome::RequiresReconciliation { reason })
    }

    async fn apply_pending(&self, mut session: CheckoutSession) -> Result<WebhookOutcome, BillingError> {
        if session.status == CheckoutStatus::Pending {
            return Ok(WebhookOutcome::MarkedPending);
        }
        session.mark_pending().map_err(BillingError::Conflict)?;
        self.store.commit(UnitOfWork::new().session(session)).await?;
        Ok(WebhookOutcome::MarkedPending)
    }

    async fn apply_expired(&self, mut session: CheckoutSession, now: DateTime<Utc>) -> Result<WebhookOutcome, BillingError> {
        session.mark_expired(now).map_err(BillingError::Conflict)?;
        let session_id = session.id;
        self.store.commit(UnitOfWork::new().session(session)).await?;
        log::info!("Session {} expired at the gateway", session_id);
        Ok(WebhookOutcome::MarkedExpired)
    }

    async fn apply_failed(
        &self,
        mut session: CheckoutSession,
        event: &PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, BillingError> {
        let reason = event
            .failure_reason
            .clone()
            .unwrap_or_else(|| "payment failed".to_string());

        let mut work = UnitOfWork::new();
        if let Some(external_id) = &event.gateway_transaction_id {
            if self.store.find_transaction(event.gateway, external_id).await?.is_none() {
                let subscription_id = match session.subscription_id {
                    Some(id) => Some(id),
                    None => self
                        .store
                        .get_subscription_by_user(session.user_id)
                        .await?
                        .map(|subscription| subscription.id),
                };
                work.transaction = Some(PaymentTransaction::failed(
                    &session,
                    subscription_id,
                    ChargeDetails {
                        gateway: event.gateway,
                        gateway_external_id: external_id.clone(),
                        amount: event.amount_received.unwrap_or(session.amount),
                        payment_method: event.payment_method.clone(),
                        paid_at: None,
                    },
                    Some(reason.clone()),
                    now,
                ));
            }
        }

        session
            .mark_failed(Some(reason.clone()), now)
            .map_err(BillingError::Conflict)?;
        let session_id = session.id;

        match self.store.commit(work.session(session)).await {
            Ok(_) => {}
            Err(StoreError::DuplicateTransaction { .. }) => return Ok(WebhookOutcome::AlreadyProcessed),
            Err(e) => return Err(e.into()),
        }

        log::warn!("❌ Session {} failed at {}: {}", session_id, event.gateway, reason);
        Ok(WebhookOutcome::MarkedFailed)
    }
}
