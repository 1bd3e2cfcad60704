use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    http_client, parse_amount, rejection, sign_hmac_sha256, verify_hmac_sha256, whole_amount, GatewayAdapter,
    GatewayError, InvoiceRef, InvoiceRequest, PaymentEvent, PaymentEventKind, ReferenceScheme, WebhookHeaders,
};
use crate::config::TripayConfig;
use crate::models::common::Gateway;

pub const REFERENCES: ReferenceScheme = ReferenceScheme::new("TRIPAY-");

const SIGNATURE_HEADER: &str = "x-callback-signature";
const EVENT_HEADER: &str = "x-callback-event";
const PAYMENT_STATUS_EVENT: &str = "payment_status";

/// Tripay closed payment.
#[derive(Clone)]
pub struct TripayAdapter {
    client: Client,
    config: TripayConfig,
}

#[derive(Debug, Deserialize)]
struct Callback {
    reference: String,
    merchant_ref: String,
    status: String,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    payment_method_code: Option<String>,
    #[serde(default)]
    total_amount: Option<Value>,
    #[serde(default)]
    paid_at: Option<i64>,
    #[serde(default)]
    note: Option<String>,
}

impl TripayAdapter {
    pub fn new(config: TripayConfig, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            client: http_client(timeout)?,
            config,
        })
    }

    fn request_signature(&self, merchant_ref: &str, amount: i64) -> Result<String, GatewayError> {
        let payload = format!("{}{}{}", self.config.merchant_code, merchant_ref, amount);
        sign_hmac_sha256(&self.config.private_key, payload.as_bytes())
    }
}

#[async_trait]
impl GatewayAdapter for TripayAdapter {
    fn gateway(&self) -> Gateway {
        Gateway::Tripay
    }

    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<InvoiceRef, GatewayError> {
        let merchant_ref = REFERENCES.encode(request.session_id);
        let amount = whole_amount(request.amount)?;
        let method = request
            .payment_channel
            .clone()
            .unwrap_or_else(|| self.config.default_method.clone());

        let payload = json!({
            "method": method,
            "merchant_ref": merchant_ref,
            "amount": amount,
            "customer_name": request.customer.name,
            "customer_email": request.customer.email,
            "customer_phone": request.customer.phone.clone().unwrap_or_default(),
            "order_items": [{
                "sku": "HRIS-SUBSCRIPTION",
                "name": request.description,
                "price": amount,
                "quantity": 1,
            }],
            "return_url": self.config.return_url,
            "expired_time": request.expires_at.timestamp(),
            "signature": self.request_signature(&merchant_ref, amount)?,
        });

        log::info!("Creating Tripay transaction {} via {}", merchant_ref, method);

        let response = self
            .client
            .post(format!("{}/transaction/create", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejection(response).await);
        }

        let created: Value = response.json().await?;
        if !created["success"].as_bool().unwrap_or(false) {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: created["message"].as_str().unwrap_or("unknown error").to_string(),
            });
        }

        let data = &created["data"];
        let reference = data["reference"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("no reference in Tripay response".to_string()))?;
        let checkout_url = data["checkout_url"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("no checkout_url in Tripay response".to_string()))?;

        Ok(InvoiceRef {
            provider_reference: reference.to_string(),
            redirect_url: checkout_url.to_string(),
            token: None,
        })
    }

    fn verify_and_parse(&self, body: &[u8], headers: &WebhookHeaders) -> Result<PaymentEvent, GatewayError> {
        let signature = headers.get(SIGNATURE_HEADER).ok_or(GatewayError::InvalidSignature)?;
        if !verify_hmac_sha256(&self.config.private_key, body, signature) {
            return Err(GatewayError::InvalidSignature);
        }

        match headers.get(EVENT_HEADER) {
            Some(PAYMENT_STATUS_EVENT) => {}
            other => {
                return Err(GatewayError::UnsupportedEvent(format!(
                    "Tripay event {}",
                    other.unwrap_or("<missing>")
                )));
            }
        }

        let callback: Callback =
            serde_json::from_slice(body).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
        let session_id = REFERENCES.decode(&callback.merchant_ref)?;

        let kind = match callback.status.to_ascii_uppercase().as_str() {
            "PAID" => PaymentEventKind::Paid,
            "UNPAID" => PaymentEventKind::Pending,
            "EXPIRED" => PaymentEventKind::Expired,
            "FAILED" => PaymentEventKind::Failed,
            other => {
                return Err(GatewayError::UnsupportedEvent(format!("Tripay status {}", other)));
            }
        };

        let paid_at = match (kind, callback.paid_at) {
            (PaymentEventKind::Paid, Some(seconds)) => Some(
                Utc.timestamp_opt(seconds, 0)
                    .single()
                    .ok_or_else(|| GatewayError::MalformedPayload(format!("paid_at {}", seconds)))?,
            ),
            _ => None,
        };

        let failure_reason = match kind {
            PaymentEventKind::Failed => Some(callback.note.unwrap_or_else(|| "payment failed".to_string())),
            _ => None,
        };

        Ok(PaymentEvent {
            kind,
            gateway: Gateway::Tripay,
            merchant_reference: callback.merchant_ref,
            session_id,
            gateway_transaction_id: Some(callback.reference),
            amount_received: callback.total_amount.as_ref().and_then(parse_amount),
            payment_method: callback.payment_method_code.or(callback.payment_method),
            paid_at,
            failure_reason,
        })
    }
}
