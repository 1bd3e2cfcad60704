use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::checkout::CheckoutPurpose;
use crate::models::notification::{Notification, NotificationKind, NotificationLog};
use crate::models::subscription::{Subscription, SubscriptionStatus, SubscriptionUsage};
use crate::services::checkout::CheckoutOrchestrator;
use crate::services::notification::NotificationDispatcher;
use crate::services::store::{BillingStore, UnitOfWork};
use crate::services::subscription::SubscriptionLifecycleManager;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub sweep: &'static str,
    pub scanned: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    fn new(sweep: &'static str, scanned: usize) -> Self {
        Self {
            sweep,
            scanned,
            ..Self::default()
        }
    }

    /// `Ok(false)` and lost version races count as skipped.
    fn tally(&mut self, subject: Uuid, result: Result<bool, BillingError>) {
        match result {
            Ok(true) => self.processed += 1,
            Ok(false) => self.skipped += 1,
            Err(BillingError::Conflict(reason)) => {
                log::warn!("{}: {} changed underneath the sweep: {}", self.sweep, subject, reason);
                self.skipped += 1;
            }
            Err(e) => {
                log::error!("❌ {}: failed for {}: {}", self.sweep, subject, e);
                self.failed += 1;
            }
        }
    }

    fn finish(self) -> Self {
        log::info!(
            "🔁 {} finished: scanned {}, processed {}, skipped {}, failed {}",
            self.sweep,
            self.scanned,
            self.processed,
            self.skipped,
            self.failed
        );
        self
    }
}

/// Cron-triggered sweeps. Each sweep keeps going after a per-item failure
/// and reports what it did.
#[derive(Clone)]
pub struct BillingAutomationScheduler {
    store: Arc<dyn BillingStore>,
    checkout: CheckoutOrchestrator,
    lifecycle: SubscriptionLifecycleManager,
    notifications: NotificationDispatcher,
    trial_warning_days: Vec<i64>,
}

impl BillingAutomationScheduler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        checkout: CheckoutOrchestrator,
        lifecycle: SubscriptionLifecycleManager,
        notifications: NotificationDispatcher,
        trial_warning_days: Vec<i64>,
    ) -> Self {
        Self {
            store,
            checkout,
            lifecycle,
            notifications,
            trial_warning_days,
        }
    }

    /// Records the notification in the log and dispatches it, unless the
    /// same kind already went out for this subscription today.
    async fn notify_once(
        &self,
        subscription: &Subscription,
        kind: NotificationKind,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<bool, BillingError> {
        let entry = NotificationLog::new(subscription.id, subscription.user_id, kind, now);
        if !self.store.record_notification(entry).await? {
            log::debug!("{} already sent today for subscription {}", kind.key(), subscription.id);
            return Ok(false);
        }

        self.notifications.dispatch(Notification {
            user_id: subscription.user_id,
            subscription_id: subscription.id,
            kind,
            message,
            created_at: now,
        });
        Ok(true)
    }

    pub async fn expire_trials(&self, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let subscriptions = self.store.list_subscriptions(&[SubscriptionStatus::Trial]).await?;
        let mut report = SweepReport::new("expire_trials", subscriptions.len());

        for subscription in subscriptions {
            if !self.lifecycle.is_trial_expired(&subscription, now) {
                continue;
            }
            let subscription_id = subscription.id;
            let result = self.expire_trial(subscription, now).await;
            report.tally(subscription_id, result);
        }

        Ok(report.finish())
    }

    async fn expire_trial(&self, mut subscription: Subscription, now: DateTime<Utc>) -> Result<bool, BillingError> {
        if !self.lifecycle.expire_trial(&mut subscription, now) {
            return Ok(false);
        }
        self.store
            .commit(UnitOfWork::new().subscription(subscription.clone()))
            .await?;
        log::info!("⌛ Trial ended for subscription {}", subscription.id);

        self.notify_once(
            &subscription,
            NotificationKind::TrialExpired,
            "Your free trial has ended. Choose a plan to keep using the HRIS.".to_string(),
            now,
        )
        .await?;
        Ok(true)
    }

    pub async fn send_trial_warnings(&self, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let subscriptions = self.store.list_subscriptions(&[SubscriptionStatus::Trial]).await?;
        let mut report = SweepReport::new("trial_warnings", subscriptions.len());

        for subscription in subscriptions {
            if !self.lifecycle.is_in_trial(&subscription, now) {
                continue;
            }
            let days_left = self.lifecycle.remaining_trial_days(&subscription, now);
            if !self.trial_warning_days.contains(&days_left) {
                continue;
            }

            let message = match days_left {
                1 => "Your free trial ends tomorrow.".to_string(),
                days => format!("Your free trial ends in {} days.", days),
            };
            let result = self
                .notify_once(&subscription, NotificationKind::TrialWarning { days_left }, message, now)
                .await;
            report.tally(subscription.id, result);
        }

        Ok(report.finish())
    }

    /// Opens a renewal checkout for every due subscription. Nothing is
    /// charged here; the payment link goes out as a notification.
    pub async fn process_renewals(&self, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let subscriptions = self.store.list_subscriptions(&[SubscriptionStatus::Active]).await?;
        let mut report = SweepReport::new("renewals", subscriptions.len());

        for subscription in subscriptions {
            if !self.lifecycle.is_due_for_renewal(&subscription, now) {
                continue;
            }
            let subscription_id = subscription.id;
            let result = self.renew(subscription, now).await;
            report.tally(subscription_id, result);
        }

        Ok(report.finish())
    }

    async fn renew(&self, subscription: Subscription, now: DateTime<Utc>) -> Result<bool, BillingError> {
        let open_sessions = self.store.list_open_sessions_for_user(subscription.user_id).await?;
        if open_sessions
            .iter()
            .any(|session| session.purpose == CheckoutPurpose::Renewal && !session.is_settled(now))
        {
            log::debug!("Renewal for subscription {} is already awaiting payment", subscription.id);
            return Ok(false);
        }

        // A failed invoice leaves no claim behind, so the next sweep retries.
        let session = self.checkout.initiate_renewal(&subscription, now).await?;
        log::info!(
            "📅 Renewal checkout {} opened for subscription {} ({} {})",
            session.id,
            subscription.id,
            session.amount,
            session.currency
        );

        let entry = NotificationLog::new(subscription.id, subscription.user_id, NotificationKind::RenewalDue, now);
        if !self.store.record_notification(entry).await? {
            log::info!(
                "Renewal notice for subscription {} already sent today; checkout {} stays open",
                subscription.id,
                session.id
            );
            return Ok(false);
        }

        self.notifications.dispatch(Notification {
            user_id: subscription.user_id,
            subscription_id: subscription.id,
            kind: NotificationKind::RenewalDue,
            message: format!(
                "Your subscription is due for renewal. Pay {} {} here: {}",
                session.amount,
                session.currency,
                session.redirect_url.as_deref().unwrap_or("-")
            ),
            created_at: now,
        });
        Ok(true)
    }

    pub async fn snapshot_usage(&self, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let subscriptions = self
            .store
            .list_subscriptions(&[SubscriptionStatus::Trial, SubscriptionStatus::Active])
            .await?;
        let mut report = SweepReport::new("usage_snapshot", subscriptions.len());

        for subscription in subscriptions {
            let subscription_id = subscription.id;
            let result = self.snapshot(subscription, now).await;
            report.tally(subscription_id, result);
        }

        Ok(report.finish())
    }

    async fn snapshot(&self, mut subscription: Subscription, now: DateTime<Utc>) -> Result<bool, BillingError> {
        let employee_count = self.store.count_employees(subscription.user_id).await?;
        let seat_plan = self
            .store
            .get_seat_plan(subscription.seat_plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("seat plan {}", subscription.seat_plan_id)))?;

        if !seat_plan.covers(employee_count) {
            log::warn!(
                "Subscription {} has {} employees, above the {} limit of {}",
                subscription.id,
                employee_count,
                seat_plan.name,
                seat_plan.max_employees
            );
        }

        if subscription.current_employee_count != employee_count {
            subscription.current_employee_count = employee_count;
            subscription.updated_at = now;
            self.store
                .commit(UnitOfWork::new().subscription(subscription.clone()))
                .await?;
        }

        self.store
            .append_usage(SubscriptionUsage {
                id: Uuid::new_v4(),
                subscription_id: subscription.id,
                employee_count,
                seat_limit: seat_plan.max_employees,
                recorded_at: now,
            })
            .await?;
        Ok(true)
    }

    /// Persists `expired` on open sessions past their expiry so they stop
    /// showing up as open.
    pub async fn expire_stale_sessions(&self, now: DateTime<Utc>) -> Result<SweepReport, BillingError> {
        let sessions = self.store.list_open_sessions().await?;
        let mut report = SweepReport::new("expire_sessions", sessions.len());

        for mut session in sessions {
            if now < session.expires_at {
                continue;
            }
            let session_id = session.id;
            let result = match session.mark_expired(now) {
                Ok(()) => self
                    .store
                    .commit(UnitOfWork::new().session(session))
                    .await
                    .map(|_| true)
                    .map_err(BillingError::from),
                Err(_) => Ok(false),
            };
            report.tally(session_id, result);
        }

        Ok(report.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::checkout::CheckoutStatus;
    use crate::models::common::{BillingPeriod, Gateway};
    use crate::models::subscription::CustomerBillingInfo;
    use crate::services::checkout::CheckoutSettings;
    use crate::services::fixtures::{customer, pending_session, seed, shared, Catalog};
    use crate::services::gateway::tests::StubGateway;
    use crate::services::gateway::{GatewayError, GatewayRegistry};
    use crate::services::store::MemoryStore;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        store: MemoryStore,
        catalog: Catalog,
        gateway: Arc<StubGateway>,
        scheduler: BillingAutomationScheduler,
        notifications: UnboundedReceiver<Notification>,
    }

    async fn harness() -> Harness {
        let store = MemoryStore::new();
        let catalog = seed(&store).await;
        let gateway = Arc::new(StubGateway::new(Gateway::Midtrans));
        let lifecycle = SubscriptionLifecycleManager::new(14);
        let checkout = CheckoutOrchestrator::new(
            shared(&store),
            GatewayRegistry::new(Gateway::Midtrans).with_adapter(gateway.clone()),
            lifecycle,
            CheckoutSettings {
                currency: "IDR".to_string(),
                session_ttl: Duration::hours(24),
            },
        );
        let (dispatcher, notifications) = NotificationDispatcher::channel();
        let scheduler =
            BillingAutomationScheduler::new(shared(&store), checkout, lifecycle, dispatcher, vec![7, 3, 1]);

        Harness {
            store,
            catalog,
            gateway,
            scheduler,
            notifications,
        }
    }

    async fn trial_started_at(h: &Harness, started: DateTime<Utc>) -> Subscription {
        let mut subscription = Subscription::new(
            Uuid::new_v4(),
            h.catalog.basic,
            h.catalog.basic_small.id,
            started,
        );
        subscription.start_trial(14, started).unwrap();
        h.store
            .commit(UnitOfWork::new().subscription(subscription))
            .await
            .unwrap()
            .subscription
            .unwrap()
    }

    async fn active_since(h: &Harness, started: DateTime<Utc>, with_billing_info: bool) -> Subscription {
        let mut subscription = Subscription::new(
            Uuid::new_v4(),
            h.catalog.basic,
            h.catalog.basic_small.id,
            started,
        );
        subscription.activate(BillingPeriod::Monthly, started);
        let mut work = UnitOfWork::new().subscription(subscription.clone());
        if with_billing_info {
            work = work.billing_info(CustomerBillingInfo::from_contact(subscription.id, &customer(), started));
        }
        h.store.commit(work).await.unwrap().subscription.unwrap()
    }

    fn drain(receiver: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut sent = Vec::new();
        while let Ok(notification) = receiver.try_recv() {
            sent.push(notification);
        }
        sent
    }

    #[tokio::test]
    async fn test_expire_trials() {
        let mut h = harness().await;
        let now = Utc::now();
        let ended = trial_started_at(&h, now - Duration::days(15)).await;
        let running = trial_started_at(&h, now - Duration::days(3)).await;

        let report = h.scheduler.expire_trials(now).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let stored = h.store.get_subscription_by_user(ended.user_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Expired);
        assert!(stored.is_trial_used);
        let stored = h.store.get_subscription_by_user(running.user_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Trial);

        let sent = drain(&mut h.notifications);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::TrialExpired);

        let report = h.scheduler.expire_trials(now).await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(drain(&mut h.notifications).is_empty());
    }

    #[tokio::test]
    async fn test_trial_warning_sent_once_per_day() {
        let mut h = harness().await;
        let now = Utc::now();
        trial_started_at(&h, now - Duration::days(7)).await;
        trial_started_at(&h, now - Duration::days(5)).await;

        let report = h.scheduler.send_trial_warnings(now).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.processed, 1);

        let report = h.scheduler.send_trial_warnings(now).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 1);

        let sent = drain(&mut h.notifications);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::TrialWarning { days_left: 7 });
    }

    #[tokio::test]
    async fn test_renewal_opens_one_checkout() {
        let mut h = harness().await;
        let now = Utc::now();
        let due = active_since(&h, now - Duration::days(30), true).await;
        active_since(&h, now - Duration::days(10), true).await;

        let report = h.scheduler.process_renewals(now).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.processed, 1);

        let sessions = h.store.list_open_sessions_for_user(due.user_id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].purpose, CheckoutPurpose::Renewal);
        assert_eq!(sessions[0].amount, Decimal::from(500_000));
        assert_eq!(sessions[0].status, CheckoutStatus::Pending);

        // Later the same day and on the next day the open session blocks a second invoice.
        let report = h.scheduler.process_renewals(now + Duration::hours(2)).await.unwrap();
        assert_eq!(report.skipped, 1);
        let report = h.scheduler.process_renewals(now + Duration::hours(20)).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.gateway.invoice_count(), 1);

        let sent = drain(&mut h.notifications);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::RenewalDue);
        assert!(sent[0].message.contains("https://pay.example.com/"));
    }

    #[tokio::test]
    async fn test_renewal_retried_after_gateway_timeout() {
        let mut h = harness().await;
        let now = Utc::now();
        let due = active_since(&h, now - Duration::days(30), true).await;
        *h.gateway.fail_with.lock().unwrap() = Some(GatewayError::Timeout);

        let report = h.scheduler.process_renewals(now).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(h.store.list_open_sessions_for_user(due.user_id).await.unwrap().is_empty());
        assert!(drain(&mut h.notifications).is_empty());

        let report = h.scheduler.process_renewals(now + Duration::minutes(10)).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(h.gateway.invoice_count(), 2);

        let sessions = h.store.list_open_sessions_for_user(due.user_id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, CheckoutStatus::Pending);
        let sent = drain(&mut h.notifications);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::RenewalDue);
    }

    #[tokio::test]
    async fn test_renewal_without_billing_contact_fails_alone() {
        let h = harness().await;
        let now = Utc::now();
        active_since(&h, now - Duration::days(31), false).await;
        active_since(&h, now - Duration::days(31), true).await;

        let report = h.scheduler.process_renewals(now).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_usage_snapshot() {
        let h = harness().await;
        let now = Utc::now();
        let subscription = active_since(&h, now - Duration::days(5), true).await;
        h.store.set_employee_count(subscription.user_id, 30).unwrap();

        let report = h.scheduler.snapshot_usage(now).await.unwrap();
        assert_eq!(report.processed, 1);

        let stored = h
            .store
            .get_subscription_by_user(subscription.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.current_employee_count, 30);

        let usage = h.store.list_usage(subscription.id).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].employee_count, 30);
        assert_eq!(usage[0].seat_limit, 25);
    }

    #[tokio::test]
    async fn test_expire_stale_sessions() {
        let h = harness().await;
        let now = Utc::now();
        let store = shared(&h.store);
        let stale = pending_session(
            store.as_ref(),
            Uuid::new_v4(),
            &h.catalog.basic_small,
            CheckoutPurpose::NewSubscription,
            Decimal::from(500_000),
            Gateway::Midtrans,
            now - Duration::days(2),
        )
        .await;
        let fresh = pending_session(
            store.as_ref(),
            Uuid::new_v4(),
            &h.catalog.basic_small,
            CheckoutPurpose::NewSubscription,
            Decimal::from(500_000),
            Gateway::Midtrans,
            now,
        )
        .await;

        let report = h.scheduler.expire_stale_sessions(now).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.processed, 1);

        let stored = h.store.get_session(stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CheckoutStatus::Expired);
        let stored = h.store.get_session(fresh.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CheckoutStatus::Pending);
    }
}
