use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use validator::Validate;

use crate::models::common::{BillingPeriod, CustomerContact};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Inactive,
    Suspended,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    /// Expired and cancelled subscriptions no longer count against the
    /// one-subscription-per-admin rule.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Expired | SubscriptionStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub is_trial_used: bool,
    pub trial_start_date: Option<DateTime<Utc>>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub subscription_start_date: Option<DateTime<Utc>>,
    pub subscription_end_date: Option<DateTime<Utc>>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub is_auto_renew: bool,
    pub current_employee_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionStatusResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_plan_id: Uuid,
    pub seat_plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub is_in_trial: bool,
    pub remaining_trial_days: i64,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub subscription_end_date: Option<DateTime<Utc>>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub is_auto_renew: bool,
    pub current_employee_count: u32,
}

impl Subscription {
    pub fn new(user_id: Uuid, subscription_plan_id: Uuid, seat_plan_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            subscription_plan_id,
            seat_plan_id,
            status: SubscriptionStatus::Inactive,
            is_trial_used: false,
            trial_start_date: None,
            trial_end_date: None,
            subscription_start_date: None,
            subscription_end_date: None,
            next_billing_date: None,
            is_auto_renew: true,
            current_employee_count: 0,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// The only place trial fields are written.
    pub fn start_trial(&mut self, trial_days: i64, now: DateTime<Utc>) -> Result<(), String> {
        if self.is_trial_used {
            return Err("Trial has already been used for this account".to_string());
        }

        self.status = SubscriptionStatus::Trial;
        self.trial_start_date = Some(now);
        self.trial_end_date = Some(now + Duration::days(trial_days));
        self.is_trial_used = true;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_in_trial(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Trial
            && self.trial_end_date.map_or(false, |end| now < end)
    }

    pub fn is_trial_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Trial
            && self.trial_end_date.map_or(true, |end| now >= end)
    }

    /// Whole days left in the trial, floored. Zero outside an ongoing trial.
    pub fn remaining_trial_days(&self, now: DateTime<Utc>) -> i64 {
        if !self.is_in_trial(now) {
            return 0;
        }
        self.trial_end_date
            .map(|end| end.signed_duration_since(now).num_days().max(0))
            .unwrap_or(0)
    }

    /// Starts a fresh paid period from `now`.
    pub fn activate(&mut self, period: BillingPeriod, now: DateTime<Utc>) {
        let end = now + Duration::days(period.duration_days());

        self.status = SubscriptionStatus::Active;
        self.subscription_start_date = Some(now);
        self.subscription_end_date = Some(end);
        self.next_billing_date = Some(end);
        self.updated_at = now;
    }

    /// Appends one period after the current one; a lapsed subscription
    /// restarts from `now`.
    pub fn extend(&mut self, period: BillingPeriod, now: DateTime<Utc>) {
        let start = match self.subscription_end_date {
            Some(end) if end > now && self.status == SubscriptionStatus::Active => end,
            _ => now,
        };
        let end = start + Duration::days(period.duration_days());

        self.status = SubscriptionStatus::Active;
        self.subscription_start_date = Some(start);
        self.subscription_end_date = Some(end);
        self.next_billing_date = Some(end);
        self.updated_at = now;
    }

    pub fn switch_plan(&mut self, subscription_plan_id: Uuid, seat_plan_id: Uuid, now: DateTime<Utc>) {
        self.subscription_plan_id = subscription_plan_id;
        self.seat_plan_id = seat_plan_id;
        self.updated_at = now;
    }

    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Expired;
        self.updated_at = now;
    }

    pub fn is_due_for_renewal(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self.is_auto_renew
            && self.next_billing_date.map_or(false, |due| due <= now)
    }

    /// Period of the current billing interval, judged by its length.
    pub fn current_period(&self) -> BillingPeriod {
        match (self.subscription_start_date, self.subscription_end_date) {
            (Some(start), Some(end)) => {
                BillingPeriod::from_interval_days(end.signed_duration_since(start).num_days())
            }
            _ => BillingPeriod::Monthly,
        }
    }

    pub fn to_status_response(&self, now: DateTime<Utc>) -> SubscriptionStatusResponse {
        SubscriptionStatusResponse {
            id: self.id,
            user_id: self.user_id,
            subscription_plan_id: self.subscription_plan_id,
            seat_plan_id: self.seat_plan_id,
            status: self.status,
            is_in_trial: self.is_in_trial(now),
            remaining_trial_days: self.remaining_trial_days(now),
            trial_end_date: self.trial_end_date,
            subscription_end_date: self.subscription_end_date,
            next_billing_date: self.next_billing_date,
            is_auto_renew: self.is_auto_renew,
            current_employee_count: self.current_employee_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialActivity {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub is_converted: bool,
    pub converted_at: Option<DateTime<Utc>>,
    pub features_used: BTreeMap<String, u32>,
    #[serde(default)]
    pub version: u64,
}

impl TrialActivity {
    pub fn for_subscription(subscription: &Subscription, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            user_id: subscription.user_id,
            started_at: subscription.trial_start_date.unwrap_or(now),
            ends_at: subscription.trial_end_date.unwrap_or(now),
            is_converted: false,
            converted_at: None,
            features_used: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn record_feature(&mut self, feature: &str) {
        *self.features_used.entry(feature.to_string()).or_insert(0) += 1;
    }

    pub fn mark_converted(&mut self, now: DateTime<Utc>) {
        if !self.is_converted {
            self.is_converted = true;
            self.converted_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, PartialEq)]
pub struct BillingInfoInput {
    #[validate(length(min = 1, max = 200, message = "Company name must be between 1 and 200 characters"))]
    pub company_name: String,

    #[validate(length(min = 1, max = 100, message = "Contact name must be between 1 and 100 characters"))]
    pub contact_name: String,

    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    pub phone: Option<String>,
    pub address: Option<String>,
    pub tax_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerBillingInfo {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub company_name: String,
    pub contact_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub tax_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl CustomerBillingInfo {
    pub fn new(subscription_id: Uuid, input: BillingInfoInput, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            company_name: input.company_name,
            contact_name: input.contact_name,
            email: input.email.to_lowercase(),
            phone: input.phone,
            address: input.address,
            tax_id: input.tax_id,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Minimal record built from the payer of a checkout.
    pub fn from_contact(subscription_id: Uuid, contact: &CustomerContact, now: DateTime<Utc>) -> Self {
        Self::new(
            subscription_id,
            BillingInfoInput {
                company_name: contact.name.clone(),
                contact_name: contact.name.clone(),
                email: contact.email.clone(),
                phone: contact.phone.clone(),
                address: None,
                tax_id: None,
            },
            now,
        )
    }

    pub fn update(&mut self, input: BillingInfoInput, now: DateTime<Utc>) {
        self.company_name = input.company_name;
        self.contact_name = input.contact_name;
        self.email = input.email.to_lowercase();
        self.phone = input.phone;
        self.address = input.address;
        self.tax_id = input.tax_id;
        self.updated_at = now;
    }

    pub fn contact(&self) -> CustomerContact {
        CustomerContact {
            name: self.contact_name.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionUsage {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub employee_count: u32,
    pub seat_limit: u32,
    pub recorded_at: DateTime<Utc>,
}
