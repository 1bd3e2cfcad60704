use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::checkout::CheckoutSession;
use crate::models::common::Gateway;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Paid,
    Failed,
    Expired,
}

/// A gateway charge, unique per `(gateway, gateway_external_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub checkout_session_id: Uuid,
    pub gateway: Gateway,
    pub gateway_invoice_id: Option<String>,
    pub gateway_external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub payment_method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Gateway-side facts about a charge, as reported by a webhook.
#[derive(Debug, Clone)]
pub struct ChargeDetails {
    pub gateway: Gateway,
    pub gateway_external_id: String,
    pub amount: Decimal,
    pub payment_method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    pub fn paid(
        session: &CheckoutSession,
        subscription_id: Uuid,
        charge: ChargeDetails,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id: Some(subscription_id),
            checkout_session_id: session.id,
            gateway: charge.gateway,
            gateway_invoice_id: session.provider_reference.clone(),
            gateway_external_id: charge.gateway_external_id,
            amount: charge.amount,
            currency: session.currency.clone(),
            status: TransactionStatus::Paid,
            payment_method: charge.payment_method,
            paid_at: Some(charge.paid_at.unwrap_or(now)),
            failure_reason: None,
            created_at: now,
        }
    }

    pub fn failed(
        session: &CheckoutSession,
        subscription_id: Option<Uuid>,
        charge: ChargeDetails,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            checkout_session_id: session.id,
            gateway: charge.gateway,
            gateway_invoice_id: session.provider_reference.clone(),
            gateway_external_id: charge.gateway_external_id,
            amount: charge.amount,
            currency: session.currency.clone(),
            status: TransactionStatus::Failed,
            payment_method: charge.payment_method,
            paid_at: None,
            failure_reason: reason,
            created_at: now,
        }
    }
}
