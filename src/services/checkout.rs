use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::BillingError;
use crate::models::checkout::{
    CheckoutPurpose, CheckoutSession, CheckoutStatus, ConvertTrialRequest, NewPaidCheckout,
    PaidCheckoutRequest, PlanChangePreview, PlanChangeRequest,
};
use crate::models::common::{BillingPeriod, CustomerContact, Gateway};
use crate::models::plan::{SeatPlan, SubscriptionPlan};
use crate::models::subscription::{
    BillingInfoInput, CustomerBillingInfo, Subscription, SubscriptionStatus, TrialActivity,
};
use crate::services::gateway::{GatewayRegistry, InvoiceRequest};
use crate::services::store::{BillingStore, UnitOfWork};
use crate::services::subscription::{SubscriptionLifecycleManager, SEAT_PLAN_NOT_IN_PLAN};

#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: String,
    pub session_ttl: Duration,
}

impl CheckoutSettings {
    pub fn from_config(app: &AppConfig) -> Self {
        Self {
            currency: app.currency.clone(),
            session_ttl: Duration::hours(app.checkout_expiry_hours),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlanChangeResult {
    /// Upgrade: the plan switches once the gateway confirms payment.
    PaymentRequired { session: CheckoutSession },
    /// Downgrade: applied immediately.
    Applied { subscription: Subscription },
}

/// Options a paid checkout passes through to the gateway.
#[derive(Debug, Clone, Default)]
pub struct PaymentOptions {
    pub gateway: Option<Gateway>,
    pub payment_channel: Option<String>,
}

#[derive(Clone)]
pub struct CheckoutOrchestrator {
    store: Arc<dyn BillingStore>,
    gateways: GatewayRegistry,
    lifecycle: SubscriptionLifecycleManager,
    settings: CheckoutSettings,
}

impl CheckoutOrchestrator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateways: GatewayRegistry,
        lifecycle: SubscriptionLifecycleManager,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            store,
            gateways,
            lifecycle,
            settings,
        }
    }

    async fn load_subscription_plan(&self, id: Uuid) -> Result<SubscriptionPlan, BillingError> {
        self.store
            .get_subscription_plan(id)
            .await?
            .filter(|plan| plan.is_active)
            .ok_or_else(|| BillingError::NotFound(format!("subscription plan {}", id)))
    }

    async fn load_seat_plan(&self, id: Uuid) -> Result<SeatPlan, BillingError> {
        self.store
            .get_seat_plan(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("seat plan {}", id)))
    }

    /// An active plan together with one of its active seat plans.
    async fn load_offer(&self, plan_id: Uuid, seat_plan_id: Uuid) -> Result<(SubscriptionPlan, SeatPlan), BillingError> {
        let plan = self.load_subscription_plan(plan_id).await?;
        let seat_plan = self.load_seat_plan(seat_plan_id).await?;
        if !seat_plan.is_active {
            return Err(BillingError::Validation(format!("Seat plan {} is no longer offered", seat_plan.name)));
        }
        if seat_plan.subscription_plan_id != plan.id {
            return Err(BillingError::Validation(format!(
                "Seat plan {} does not belong to subscription plan {}",
                seat_plan.name, plan.name
            )));
        }
        Ok((plan, seat_plan))
    }

    async fn load_user_subscription(&self, user_id: Uuid) -> Result<Subscription, BillingError> {
        self.store
            .get_subscription_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))
    }

    /// Rejects a new paid checkout while another one for the same user is
    /// still waiting on the gateway.
    async fn ensure_no_payment_in_flight(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), BillingError> {
        let open = self.store.list_open_sessions_for_user(user_id).await?;
        if let Some(session) = open
            .iter()
            .find(|session| !session.is_trial_checkout && !session.is_settled(now))
        {
            return Err(BillingError::Validation(format!(
                "Checkout session {} is still awaiting payment",
                session.id
            )));
        }
        Ok(())
    }

    pub async fn initiate_trial(
        &self,
        user_id: Uuid,
        subscription_plan_id: Uuid,
        seat_plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSession, BillingError> {
        let (plan, seat_plan) = self.load_offer(subscription_plan_id, seat_plan_id).await?;

        if let Some(existing) = self.store.get_subscription_by_user(user_id).await? {
            if existing.is_trial_used {
                return Err(BillingError::Validation(
                    "Trial has already been used for this account".to_string(),
                ));
            }
            if !SubscriptionLifecycleManager::is_replaceable(&existing) {
                return Err(BillingError::Validation(format!(
                    "User already has a {} subscription",
                    existing.status.as_str()
                )));
            }
        }

        let session = CheckoutSession::new_trial(
            user_id,
            plan.id,
            seat_plan.id,
            &self.settings.currency,
            self.settings.session_ttl,
            now,
        );
        let receipt = self.store.commit(UnitOfWork::new().session(session)).await?;
        let session = receipt
            .session
            .ok_or_else(|| BillingError::Store("commit returned no session".to_string()))?;

        log::info!("Trial checkout {} opened for user {} on {}", session.id, user_id, plan.name);
        Ok(session)
    }

    /// Starts the trial a trial checkout was opened for. Completing an
    /// already completed session returns the existing result.
    pub async fn complete_trial_checkout(
        &self,
        session_id: Uuid,
        billing_info: Option<BillingInfoInput>,
        now: DateTime<Utc>,
    ) -> Result<(CheckoutSession, Subscription), BillingError> {
        let mut session = self.get_session(session_id).await?;
        if !session.is_trial_checkout {
            return Err(BillingError::Validation(format!(
                "Checkout session {} is not a trial checkout",
                session_id
            )));
        }

        if session.status == CheckoutStatus::Completed {
            let subscription = self.load_user_subscription(session.user_id).await?;
            return Ok((session, subscription));
        }
        if session.is_settled(now) {
            return Err(BillingError::Validation(format!(
                "Checkout session {} is {}",
                session_id,
                session.effective_status(now).as_str()
            )));
        }

        let existing = self.store.get_subscription_by_user(session.user_id).await?;
        let subscription = self.lifecycle.new_trial_subscription(
            existing,
            session.user_id,
            session.subscription_plan_id,
            session.seat_plan_id,
            now,
        )?;
        let activity = TrialActivity::for_subscription(&subscription, now);

        let info = match billing_info {
            Some(input) => Some(match self.store.get_billing_info(subscription.id).await? {
                Some(mut info) => {
                    info.update(input, now);
                    info
                }
                None => CustomerBillingInfo::new(subscription.id, input, now),
            }),
            None => None,
        };

        session
            .mark_completed(subscription.id, None, now)
            .map_err(BillingError::Conflict)?;

        let mut work = UnitOfWork::new()
            .session(session)
            .subscription(subscription)
            .trial_activity(activity);
        work.billing_info = info;

        let receipt = self.store.commit(work).await?;
        let (session, subscription) = match (receipt.session, receipt.subscription) {
            (Some(session), Some(subscription)) => (session, subscription),
            _ => return Err(BillingError::Store("commit returned no records".to_string())),
        };

        log::info!(
            "🎉 Trial started for user {}: subscription {} until {:?}",
            subscription.user_id,
            subscription.id,
            subscription.trial_end_date
        );
        Ok((session, subscription))
    }

    pub async fn initiate_paid(
        &self,
        request: PaidCheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSession, BillingError> {
        let (plan, seat_plan) = self
            .load_offer(request.subscription_plan_id, request.seat_plan_id)
            .await?;

        if let Some(existing) = self.store.get_subscription_by_user(request.user_id).await? {
            if matches!(existing.status, SubscriptionStatus::Active | SubscriptionStatus::Suspended) {
                return Err(BillingError::Validation(
                    "User already has a paid subscription; change the plan instead".to_string(),
                ));
            }
        }
        self.ensure_no_payment_in_flight(request.user_id, now).await?;

        let period = BillingPeriod::from_is_monthly(request.is_monthly);
        let description = format!("{} {} ({})", plan.name, seat_plan.name, period);

        self.open_paid_checkout(
            NewPaidCheckout {
                user_id: request.user_id,
                subscription_plan_id: plan.id,
                seat_plan_id: seat_plan.id,
                purpose: CheckoutPurpose::NewSubscription,
                source_seat_plan_id: None,
                amount: seat_plan.price(period),
                currency: self.settings.currency.clone(),
                billing_period: period,
                gateway: request.gateway.unwrap_or_else(|| self.gateways.default_gateway()),
                customer: request.customer,
            },
            request.payment_channel,
            description,
            now,
        )
        .await
    }

    /// Persists an `initiated` session, asks the gateway for an invoice and
    /// moves the session to `pending`. If the gateway fails the session is
    /// stored as `failed` and the gateway error is returned.
    async fn open_paid_checkout(
        &self,
        checkout: NewPaidCheckout,
        payment_channel: Option<String>,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSession, BillingError> {
        let adapter = self.gateways.get(Some(checkout.gateway))?;

        let session = CheckoutSession::new_paid(checkout, self.settings.session_ttl, now)
            .map_err(BillingError::Validation)?;
        let mut session = self
            .store
            .commit(UnitOfWork::new().session(session))
            .await?
            .session
            .ok_or_else(|| BillingError::Store("commit returned no session".to_string()))?;

        let request = InvoiceRequest {
            session_id: session.id,
            amount: session.amount,
            currency: session.currency.clone(),
            description,
            customer: session
                .customer
                .clone()
                .ok_or_else(|| BillingError::Validation("customer contact is required".to_string()))?,
            expires_at: session.expires_at,
            payment_channel,
        };

        match adapter.create_invoice(&request).await {
            Ok(invoice) => {
                session
                    .attach_invoice(invoice.provider_reference, invoice.redirect_url, invoice.token)
                    .map_err(BillingError::Conflict)?;
                let session = self
                    .store
                    .commit(UnitOfWork::new().session(session))
                    .await?
                    .session
                    .ok_or_else(|| BillingError::Store("commit returned no session".to_string()))?;

                log::info!(
                    "💳 {:?} checkout {} pending at {} for {} {}",
                    session.purpose,
                    session.id,
                    adapter.gateway(),
                    session.amount,
                    session.currency
                );
                Ok(session)
            }
            Err(e) => {
                log::error!(
                    "❌ Invoice creation failed for session {} (retryable: {}): {}",
                    session.id,
                    e.is_retryable(),
                    e
                );
                let session_id = session.id;
                session
                    .mark_failed(Some(e.to_string()), now)
                    .map_err(BillingError::Conflict)?;
                if let Err(store_error) = self.store.commit(UnitOfWork::new().session(session)).await {
                    log::error!("Failed to mark session {} as failed: {}", session_id, store_error);
                }
                Err(BillingError::Gateway(e))
            }
        }
    }

    /// Seat plan a change targets. Without an explicit choice the target
    /// plan's seat plan covering the same employee band is used.
    async fn resolve_target_seat(
        &self,
        current_seat: &SeatPlan,
        current_plan_id: Uuid,
        target_plan_id: Uuid,
        explicit_seat: Option<Uuid>,
    ) -> Result<SeatPlan, BillingError> {
        match explicit_seat {
            Some(seat_plan_id) => {
                let seat_plan = self.load_seat_plan(seat_plan_id).await?;
                if target_plan_id == current_plan_id {
                    self.lifecycle
                        .validate_seat_plan_membership(&seat_plan, current_plan_id)?;
                } else if seat_plan.subscription_plan_id != target_plan_id {
                    return Err(BillingError::Validation(
                        "seat plan does not belong to the selected subscription plan".to_string(),
                    ));
                }
                if !seat_plan.is_active {
                    return Err(BillingError::Validation(format!(
                        "Seat plan {} is no longer offered",
                        seat_plan.name
                    )));
                }
                Ok(seat_plan)
            }
            None if target_plan_id == current_plan_id => Ok(current_seat.clone()),
            None => self
                .store
                .list_seat_plans(target_plan_id)
                .await?
                .into_iter()
                .find(|seat_plan| seat_plan.is_active && seat_plan.same_band(current_seat))
                .ok_or_else(|| BillingError::Validation("no matching seat plan found".to_string())),
        }
    }

    /// Prices a plan or seat change as the flat difference between the two
    /// period prices. Reads only.
    pub async fn preview_plan_change(
        &self,
        user_id: Uuid,
        new_subscription_plan_id: Option<Uuid>,
        new_seat_plan_id: Option<Uuid>,
        is_monthly: bool,
    ) -> Result<PlanChangePreview, BillingError> {
        let subscription = self.load_user_subscription(user_id).await?;
        if subscription.status != SubscriptionStatus::Active {
            return Err(BillingError::Validation(format!(
                "Plan changes require an active subscription, current status is {}",
                subscription.status.as_str()
            )));
        }

        let current_seat = self.load_seat_plan(subscription.seat_plan_id).await?;
        let target_plan_id = match new_subscription_plan_id {
            Some(plan_id) => self.load_subscription_plan(plan_id).await?.id,
            None => subscription.subscription_plan_id,
        };
        let target_seat = self
            .resolve_target_seat(
                &current_seat,
                subscription.subscription_plan_id,
                target_plan_id,
                new_seat_plan_id,
            )
            .await?;

        if target_plan_id == subscription.subscription_plan_id && target_seat.id == current_seat.id {
            return Err(BillingError::Validation(
                "Subscription is already on this plan".to_string(),
            ));
        }

        let period = BillingPeriod::from_is_monthly(is_monthly);
        let current_price = current_seat.price(period);
        let new_price = target_seat.price(period);
        let price_difference = new_price - current_price;
        let is_upgrade = price_difference > Decimal::ZERO;

        Ok(PlanChangePreview {
            current_subscription_plan_id: subscription.subscription_plan_id,
            current_seat_plan_id: current_seat.id,
            target_subscription_plan_id: target_plan_id,
            target_seat_plan_id: target_seat.id,
            billing_period: period,
            current_price,
            new_price,
            price_difference,
            is_upgrade,
            requires_payment: is_upgrade,
        })
    }

    pub async fn change_plan(
        &self,
        request: PlanChangeRequest,
        now: DateTime<Utc>,
    ) -> Result<PlanChangeResult, BillingError> {
        self.ensure_no_payment_in_flight(request.user_id, now).await?;
        let preview = self
            .preview_plan_change(
                request.user_id,
                request.new_subscription_plan_id,
                request.new_seat_plan_id,
                request.is_monthly,
            )
            .await?;
        let mut subscription = self.load_user_subscription(request.user_id).await?;
        let target_seat = self.load_seat_plan(preview.target_seat_plan_id).await?;

        if preview.requires_payment {
            let customer = match request.customer {
                Some(customer) => customer,
                None => self.billing_contact(subscription.id).await?,
            };
            let plan = self.load_subscription_plan(preview.target_subscription_plan_id).await?;
            let session = self
                .open_paid_checkout(
                    NewPaidCheckout {
                        user_id: request.user_id,
                        subscription_plan_id: preview.target_subscription_plan_id,
                        seat_plan_id: preview.target_seat_plan_id,
                        purpose: CheckoutPurpose::PlanChange,
                        source_seat_plan_id: Some(preview.current_seat_plan_id),
                        amount: preview.price_difference,
                        currency: self.settings.currency.clone(),
                        billing_period: preview.billing_period,
                        gateway: request.gateway.unwrap_or_else(|| self.gateways.default_gateway()),
                        customer,
                    },
                    request.payment_channel,
                    format!("Upgrade to {} {}", plan.name, target_seat.name),
                    now,
                )
                .await?;
            return Ok(PlanChangeResult::PaymentRequired { session });
        }

        let employees = self
            .store
            .count_employees(request.user_id)
            .await?
            .max(subscription.current_employee_count);
        self.lifecycle.validate_downgrade(employees, &target_seat)?;

        self.lifecycle.apply_plan_change(
            &mut subscription,
            preview.target_subscription_plan_id,
            preview.target_seat_plan_id,
            now,
        );
        let subscription = self
            .store
            .commit(UnitOfWork::new().subscription(subscription))
            .await?
            .subscription
            .ok_or_else(|| BillingError::Store("commit returned no subscription".to_string()))?;

        log::info!(
            "⬇️ Subscription {} moved to seat plan {} without payment",
            subscription.id,
            target_seat.name
        );
        Ok(PlanChangeResult::Applied { subscription })
    }

    /// Seat plan change inside the current subscription plan.
    pub async fn change_seat_plan(
        &self,
        user_id: Uuid,
        new_seat_plan_id: Uuid,
        is_monthly: bool,
        options: PaymentOptions,
        customer: Option<CustomerContact>,
        now: DateTime<Utc>,
    ) -> Result<PlanChangeResult, BillingError> {
        self.change_plan(
            PlanChangeRequest {
                user_id,
                new_subscription_plan_id: None,
                new_seat_plan_id: Some(new_seat_plan_id),
                is_monthly,
                gateway: options.gateway,
                payment_channel: options.payment_channel,
                customer,
            },
            now,
        )
        .await
    }

    pub async fn convert_trial_to_paid(
        &self,
        request: ConvertTrialRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSession, BillingError> {
        let subscription = self.load_user_subscription(request.user_id).await?;
        if subscription.status != SubscriptionStatus::Trial {
            return Err(BillingError::Validation("subscription is not in trial".to_string()));
        }
        self.ensure_no_payment_in_flight(request.user_id, now).await?;

        let current_seat = self.load_seat_plan(subscription.seat_plan_id).await?;
        let target_plan = match request.new_subscription_plan_id {
            Some(plan_id) => self.load_subscription_plan(plan_id).await?,
            None => self.load_subscription_plan(subscription.subscription_plan_id).await?,
        };
        let target_seat = self
            .resolve_target_seat(
                &current_seat,
                subscription.subscription_plan_id,
                target_plan.id,
                request.new_seat_plan_id,
            )
            .await?;

        if let Some(input) = request.billing_info {
            self.upsert_billing_info(subscription.id, input, now).await?;
        }

        let period = BillingPeriod::from_is_monthly(request.is_monthly);
        self.open_paid_checkout(
            NewPaidCheckout {
                user_id: request.user_id,
                subscription_plan_id: target_plan.id,
                seat_plan_id: target_seat.id,
                purpose: CheckoutPurpose::TrialConversion,
                source_seat_plan_id: None,
                amount: target_seat.price(period),
                currency: self.settings.currency.clone(),
                billing_period: period,
                gateway: request.gateway.unwrap_or_else(|| self.gateways.default_gateway()),
                customer: request.customer,
            },
            request.payment_channel,
            format!("{} {} ({})", target_plan.name, target_seat.name, period),
            now,
        )
        .await
    }

    /// Opens the checkout that pays for the next period of `subscription`.
    pub async fn initiate_renewal(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<CheckoutSession, BillingError> {
        let seat_plan = self.load_seat_plan(subscription.seat_plan_id).await?;
        let plan = self.load_subscription_plan(subscription.subscription_plan_id).await?;
        let customer = self.billing_contact(subscription.id).await?;
        let period = subscription.current_period();

        self.open_paid_checkout(
            NewPaidCheckout {
                user_id: subscription.user_id,
                subscription_plan_id: plan.id,
                seat_plan_id: seat_plan.id,
                purpose: CheckoutPurpose::Renewal,
                source_seat_plan_id: None,
                amount: seat_plan.price(period),
                currency: self.settings.currency.clone(),
                billing_period: period,
                gateway: self.gateways.default_gateway(),
                customer,
            },
            None,
            format!("Renewal {} {} ({})", plan.name, seat_plan.name, period),
            now,
        )
        .await
    }

    async fn billing_contact(&self, subscription_id: Uuid) -> Result<CustomerContact, BillingError> {
        self.store
            .get_billing_info(subscription_id)
            .await?
            .map(|info| info.contact())
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "No billing contact on file for subscription {}",
                    subscription_id
                ))
            })
    }

    async fn upsert_billing_info(
        &self,
        subscription_id: Uuid,
        input: BillingInfoInput,
        now: DateTime<Utc>,
    ) -> Result<CustomerBillingInfo, BillingError> {
        let info = match self.store.get_billing_info(subscription_id).await? {
            Some(mut info) => {
                info.update(input, now);
                info
            }
            None => CustomerBillingInfo::new(subscription_id, input, now),
        };
        self.store
            .commit(UnitOfWork::new().billing_info(info))
            .await?
            .billing_info
            .ok_or_else(|| BillingError::Store("commit returned no billing info".to_string()))
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<CheckoutSession, BillingError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("checkout session {}", session_id)))
    }

    pub async fn subscription_status(&self, user_id: Uuid) -> Result<Subscription, BillingError> {
        self.load_user_subscription(user_id).await
    }

    pub async fn update_billing_info(
        &self,
        user_id: Uuid,
        input: BillingInfoInput,
        now: DateTime<Utc>,
    ) -> Result<CustomerBillingInfo, BillingError> {
        let subscription = self.load_user_subscription(user_id).await?;
        self.upsert_billing_info(subscription.id, input, now).await
    }

    pub async fn record_trial_feature_usage(
        &self,
        user_id: Uuid,
        feature: &str,
        now: DateTime<Utc>,
    ) -> Result<TrialActivity, BillingError> {
        let subscription = self.load_user_subscription(user_id).await?;
        if !self.lifecycle.is_in_trial(&subscription, now) {
            return Err(BillingError::Validation("subscription is not in trial".to_string()));
        }

        let mut activity = self
            .store
            .get_trial_activity(subscription.id)
            .await?
            .unwrap_or_else(|| TrialActivity::for_subscription(&subscription, now));
        activity.record_feature(feature);
        self.store
            .commit(UnitOfWork::new().trial_activity(activity))
            .await?
            .trial_activity
            .ok_or_else(|| BillingError::Store("commit returned no trial activity".to_string()))
    }
}
