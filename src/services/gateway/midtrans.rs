use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use std::str::FromStr;
use std::time::Duration;

use super::{
    constant_time_eq, http_client, rejection, whole_amount, GatewayAdapter, GatewayError, InvoiceRef,
    InvoiceRequest, PaymentEvent, PaymentEventKind, ReferenceScheme, WebhookHeaders,
};
use crate::config::MidtransConfig;
use crate::models::common::Gateway;

pub const REFERENCES: ReferenceScheme = ReferenceScheme::new("HRIS-");

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const JAKARTA_OFFSET_SECS: i32 = 7 * 3600;

/// Midtrans Snap.
#[derive(Clone)]
pub struct MidtransAdapter {
    client: Client,
    config: MidtransConfig,
}

#[derive(Debug, Deserialize)]
struct Notification {
    order_id: String,
    status_code: String,
    gross_amount: String,
    signature_key: String,
    transaction_status: String,
    #[serde(default)]
    fraud_status: Option<String>,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    payment_type: Option<String>,
    #[serde(default)]
    transaction_time: Option<String>,
    #[serde(default)]
    settlement_time: Option<String>,
    #[serde(default)]
    status_message: Option<String>,
}

impl MidtransAdapter {
    pub fn new(config: MidtransConfig, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            client: http_client(timeout)?,
            config,
        })
    }

    pub(crate) fn expected_signature(&self, order_id: &str, status_code: &str, gross_amount: &str) -> String {
        let mut hasher = Sha512::new();
        hasher.update(order_id.as_bytes());
        hasher.update(status_code.as_bytes());
        hasher.update(gross_amount.as_bytes());
        hasher.update(self.config.server_key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn jakarta() -> Result<FixedOffset, GatewayError> {
    FixedOffset::east_opt(JAKARTA_OFFSET_SECS)
        .ok_or_else(|| GatewayError::MalformedPayload("invalid timezone offset".to_string()))
}

fn parse_local_time(value: &str) -> Result<DateTime<Utc>, GatewayError> {
    let naive = NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|e| GatewayError::MalformedPayload(format!("time {}: {}", value, e)))?;
    jakarta()?
        .from_local_datetime(&naive)
        .single()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| GatewayError::MalformedPayload(format!("ambiguous time {}", value)))
}

#[async_trait]
impl GatewayAdapter for MidtransAdapter {
    fn gateway(&self) -> Gateway {
        Gateway::Midtrans
    }

    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<InvoiceRef, GatewayError> {
        let order_id = REFERENCES.encode(request.session_id);
        let gross_amount = whole_amount(request.amount)?;
        let now = Utc::now();
        let expiry_minutes = request
            .expires_at
            .signed_duration_since(now)
            .num_minutes()
            .max(1);
        let item_name: String = request.description.chars().take(50).collect();

        let mut payload = json!({
            "transaction_details": {
                "order_id": order_id,
                "gross_amount": gross_amount,
            },
            "customer_details": {
                "first_name": request.customer.name,
                "email": request.customer.email,
            },
            "item_details": [{
                "id": request.session_id.to_string(),
                "price": gross_amount,
                "quantity": 1,
                "name": item_name,
            }],
            "expiry": {
                "start_time": now.with_timezone(&jakarta()?).format("%Y-%m-%d %H:%M:%S %z").to_string(),
                "unit": "minute",
                "duration": expiry_minutes,
            },
            "callbacks": {
                "finish": self.config.finish_redirect_url,
            },
        });
        if let Some(phone) = &request.customer.phone {
            payload["customer_details"]["phone"] = json!(phone);
        }
        if let Some(channel) = &request.payment_channel {
            payload["enabled_payments"] = json!([channel]);
        }

        log::info!("Creating Midtrans Snap transaction {}", order_id);

        let response = self
            .client
            .post(format!("{}/snap/v1/transactions", self.config.base_url))
            .basic_auth(&self.config.server_key, Some(""))
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let snap: Value = response.json().await?;
        let token = snap["token"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("no token in Snap response".to_string()))?;
        let redirect_url = snap["redirect_url"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("no redirect_url in Snap response".to_string()))?;

        Ok(InvoiceRef {
            provider_reference: order_id,
            redirect_url: redirect_url.to_string(),
            token: Some(token.to_string()),
        })
    }

    fn verify_and_parse(&self, body: &[u8], _headers: &WebhookHeaders) -> Result<PaymentEvent, GatewayError> {
        let notification: Notification =
            serde_json::from_slice(body).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;

        let expected = self.expected_signature(
            &notification.order_id,
            &notification.status_code,
            &notification.gross_amount,
        );
        if !constant_time_eq(&expected, &notification.signature_key.to_ascii_lowercase()) {
            return Err(GatewayError::InvalidSignature);
        }

        let session_id = REFERENCES.decode(&notification.order_id)?;

        let fraud_status = notification.fraud_status.as_deref().unwrap_or("accept");
        let kind = match (notification.transaction_status.as_str(), fraud_status) {
            ("settlement", _) => PaymentEventKind::Paid,
            ("capture", "accept") => PaymentEventKind::Paid,
            ("capture", "challenge") => PaymentEventKind::Pending,
            ("capture", _) => PaymentEventKind::Failed,
            ("pending", _) => PaymentEventKind::Pending,
            ("expire", _) => PaymentEventKind::Expired,
            ("deny", _) | ("cancel", _) | ("failure", _) => PaymentEventKind::Failed,
            (other, _) => {
                return Err(GatewayError::UnsupportedEvent(format!("Midtrans status {}", other)));
            }
        };

        let paid_at = match kind {
            PaymentEventKind::Paid => notification
                .settlement_time
                .as_deref()
                .or(notification.transaction_time.as_deref())
                .map(parse_local_time)
                .transpose()?,
            _ => None,
        };

        let amount_received = Decimal::from_str(notification.gross_amount.trim())
            .map_err(|e| GatewayError::MalformedPayload(format!("gross_amount: {}", e)))?;

        let failure_reason = match kind {
            PaymentEventKind::Failed => Some(
                notification
                    .status_message
                    .unwrap_or_else(|| format!("transaction {}", notification.transaction_status)),
            ),
            _ => None,
        };

        Ok(PaymentEvent {
            kind,
            gateway: Gateway::Midtrans,
            merchant_reference: notification.order_id,
            session_id,
            gateway_transaction_id: notification.transaction_id,
            amount_received: Some(amount_received),
            payment_method: notification.payment_type,
            paid_at,
            failure_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::tests::invoice_request;
    use mockito::Matcher;
    use uuid::Uuid;

    fn config(base_url: &str) -> MidtransConfig {
        MidtransConfig {
            base_url: base_url.to_string(),
            server_key: "SB-Mid-server-test".to_string(),
            finish_redirect_url: "https://app.example.com/billing/success".to_string(),
        }
    }

    fn adapter() -> MidtransAdapter {
        MidtransAdapter::new(config("http://localhost"), Duration::from_secs(5)).unwrap()
    }

    fn notification(adapter: &MidtransAdapter, order_id: &str, status: &str, fraud: Option<&str>) -> String {
        let signature = adapter.expected_signature(order_id, "200", "500000.00");
        let mut body = json!({
            "order_id": order_id,
            "status_code": "200",
            "gross_amount": "500000.00",
            "signature_key": signature,
            "transaction_status": status,
            "transaction_id": "mt-txn-1",
            "payment_type": "bank_transfer",
            "transaction_time": "2026-03-01 10:00:00",
            "settlement_time": "2026-03-01 10:05:00",
        });
        if let Some(fraud) = fraud {
            body["fraud_status"] = json!(fraud);
        }
        body.to_string()
    }

    #[tokio::test]
    async fn test_create_snap_transaction() {
        let mut server = mockito::Server::new_async().await;
        let request = invoice_request(500_000);
        let mock = server
            .mock("POST", "/snap/v1/transactions")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::PartialJson(json!({
                "transaction_details": {
                    "order_id": format!("HRIS-{}", request.session_id),
                    "gross_amount": 500000,
                }
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"snap-token-1","redirect_url":"https://app.sandbox.midtrans.com/snap/v2/vtweb/snap-token-1"}"#)
            .create_async()
            .await;

        let adapter = MidtransAdapter::new(config(&server.url()), Duration::from_secs(5)).unwrap();
        let invoice = adapter.create_invoice(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(invoice.provider_reference, format!("HRIS-{}", request.session_id));
        assert_eq!(invoice.token.as_deref(), Some("snap-token-1"));
    }

    #[test]
    fn test_settlement_notification() {
        let adapter = adapter();
        let session_id = Uuid::new_v4();
        let body = notification(&adapter, &format!("HRIS-{}", session_id), "settlement", None);

        let event = adapter.verify_and_parse(body.as_bytes(), &WebhookHeaders::new()).unwrap();

        assert_eq!(event.kind, PaymentEventKind::Paid);
        assert_eq!(event.session_id, session_id);
        assert_eq!(event.gateway_transaction_id.as_deref(), Some("mt-txn-1"));
        assert_eq!(event.amount_received, Some(Decimal::from(500_000)));
        assert_eq!(
            event.paid_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 3, 5, 0).unwrap())
        );
    }

    #[test]
    fn test_tampered_notification_rejected() {
        let adapter = adapter();
        let body = notification(&adapter, &format!("HRIS-{}", Uuid::new_v4()), "settlement", None);
        let tampered = body.replace("500000.00", "5000.00");

        assert!(matches!(
            adapter.verify_and_parse(tampered.as_bytes(), &WebhookHeaders::new()),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[test]
    fn test_capture_fraud_states() {
        let adapter = adapter();
        let order_id = format!("HRIS-{}", Uuid::new_v4());
        let parse = |status: &str, fraud: Option<&str>| {
            let body = notification(&adapter, &order_id, status, fraud);
            adapter.verify_and_parse(body.as_bytes(), &WebhookHeaders::new())
        };

        assert_eq!(parse("capture", Some("accept")).unwrap().kind, PaymentEventKind::Paid);
        assert_eq!(parse("capture", Some("challenge")).unwrap().kind, PaymentEventKind::Pending);
        assert_eq!(parse("pending", None).unwrap().kind, PaymentEventKind::Pending);
        assert_eq!(parse("expire", None).unwrap().kind, PaymentEventKind::Expired);
        assert_eq!(parse("deny", None).unwrap().kind, PaymentEventKind::Failed);
        assert!(matches!(parse("refund", None), Err(GatewayError::UnsupportedEvent(_))));
    }
}
