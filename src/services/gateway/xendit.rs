use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    constant_time_eq, http_client, parse_amount, rejection, whole_amount, GatewayAdapter, GatewayError,
    InvoiceRef, InvoiceRequest, PaymentEvent, PaymentEventKind, ReferenceScheme, WebhookHeaders,
};
use crate::config::XenditConfig;
use crate::models::common::Gateway;

pub const REFERENCES: ReferenceScheme = ReferenceScheme::new("checkout_");

const CALLBACK_TOKEN_HEADER: &str = "x-callback-token";

/// Xendit Invoices v2.
#[derive(Clone)]
pub struct XenditAdapter {
    client: Client,
    config: XenditConfig,
}

#[derive(Debug, Deserialize)]
struct InvoiceCallback {
    id: String,
    external_id: String,
    status: String,
    #[serde(default)]
    amount: Option<Value>,
    #[serde(default)]
    paid_amount: Option<Value>,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    payment_channel: Option<String>,
    #[serde(default)]
    paid_at: Option<String>,
    #[serde(default)]
    failure_code: Option<String>,
}

impl XenditAdapter {
    pub fn new(config: XenditConfig, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            client: http_client(timeout)?,
            config,
        })
    }
}

#[async_trait]
impl GatewayAdapter for XenditAdapter {
    fn gateway(&self) -> Gateway {
        Gateway::Xendit
    }

    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<InvoiceRef, GatewayError> {
        let external_id = REFERENCES.encode(request.session_id);
        let invoice_duration = request
            .expires_at
            .signed_duration_since(Utc::now())
            .num_seconds()
            .max(60);

        let mut payload = json!({
            "external_id": external_id,
            "amount": whole_amount(request.amount)?,
            "payer_email": request.customer.email,
            "description": request.description,
            "invoice_duration": invoice_duration,
            "currency": request.currency,
            "customer": {
                "given_names": request.customer.name,
                "email": request.customer.email,
            },
            "success_redirect_url": self.config.success_redirect_url,
            "failure_redirect_url": self.config.failure_redirect_url,
        });
        if let Some(phone) = &request.customer.phone {
            payload["customer"]["mobile_number"] = json!(phone);
        }
        if let Some(channel) = &request.payment_channel {
            payload["payment_methods"] = json!([channel]);
        }

        log::info!("Creating Xendit invoice {}", external_id);

        let response = self
            .client
            .post(format!("{}/v2/invoices", self.config.base_url))
            .basic_auth(&self.config.secret_key, Some(""))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let invoice: Value = response.json().await?;
        let invoice_id = invoice["id"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("no id in Xendit invoice".to_string()))?;
        let invoice_url = invoice["invoice_url"]
            .as_str()
            .ok_or_else(|| GatewayError::MalformedPayload("no invoice_url in Xendit invoice".to_string()))?;

        log::info!("Created Xendit invoice {} for {}", invoice_id, external_id);

        Ok(InvoiceRef {
            provider_reference: invoice_id.to_string(),
            redirect_url: invoice_url.to_string(),
            token: None,
        })
    }

    fn verify_and_parse(&self, body: &[u8], headers: &WebhookHeaders) -> Result<PaymentEvent, GatewayError> {
        let token = headers
            .get(CALLBACK_TOKEN_HEADER)
            .ok_or(GatewayError::InvalidSignature)?;
        if !constant_time_eq(token, &self.config.callback_token) {
            return Err(GatewayError::InvalidSignature);
        }

        let callback: InvoiceCallback =
            serde_json::from_slice(body).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
        let session_id = REFERENCES.decode(&callback.external_id)?;

        let kind = match callback.status.to_ascii_uppercase().as_str() {
            "PAID" | "SETTLED" => PaymentEventKind::Paid,
            "PENDING" => PaymentEventKind::Pending,
            "EXPIRED" => PaymentEventKind::Expired,
            "FAILED" => PaymentEventKind::Failed,
            other => {
                return Err(GatewayError::UnsupportedEvent(format!("Xendit status {}", other)));
            }
        };

        let paid_at = callback
            .paid_at
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .map_err(|e| GatewayError::MalformedPayload(format!("paid_at: {}", e)))?
            .map(|at| at.with_timezone(&Utc));

        let amount_received = callback
            .paid_amount
            .as_ref()
            .and_then(parse_amount)
            .or_else(|| callback.amount.as_ref().and_then(parse_amount));

        let failure_reason = match kind {
            PaymentEventKind::Failed => Some(
                callback
                    .failure_code
                    .unwrap_or_else(|| "payment failed".to_string()),
            ),
            _ => None,
        };

        Ok(PaymentEvent {
            kind,
            gateway: Gateway::Xendit,
            merchant_reference: callback.external_id,
            session_id,
            gateway_transaction_id: Some(callback.id),
            amount_received,
            payment_method: callback.payment_channel.or(callback.payment_method),
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
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn config(base_url: &str) -> XenditConfig {
        XenditConfig {
            base_url: base_url.to_string(),
            secret_key: "xnd_development_secret".to_string(),
            callback_token: "callback-token".to_string(),
            success_redirect_url: "https://app.example.com/billing/success".to_string(),
            failure_redirect_url: "https://app.example.com/billing/failed".to_string(),
        }
    }

    fn adapter() -> XenditAdapter {
        XenditAdapter::new(config("http://localhost"), Duration::from_secs(5)).unwrap()
    }

    fn headers(token: &str) -> WebhookHeaders {
        vec![("X-CALLBACK-TOKEN", token)].into_iter().collect()
    }

    #[tokio::test]
    async fn test_create_invoice() {
        let mut server = mockito::Server::new_async().await;
        let request = invoice_request(500_000);
        let mock = server
            .mock("POST", "/v2/invoices")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::PartialJson(json!({
                "external_id": format!("checkout_{}", request.session_id),
                "amount": 500000,
                "currency": "IDR",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"inv_123","invoice_url":"https://checkout.xendit.co/web/inv_123"}"#)
            .create_async()
            .await;

        let adapter = XenditAdapter::new(config(&server.url()), Duration::from_secs(5)).unwrap();
        let invoice = adapter.create_invoice(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(invoice.provider_reference, "inv_123");
        assert_eq!(invoice.redirect_url, "https://checkout.xendit.co/web/inv_123");
        assert_eq!(invoice.token, None);
    }

    #[tokio::test]
    async fn test_create_invoice_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v2/invoices")
            .with_status(400)
            .with_body(r#"{"error_code":"API_VALIDATION_ERROR"}"#)
            .create_async()
            .await;

        let adapter = XenditAdapter::new(config(&server.url()), Duration::from_secs(5)).unwrap();
        let error = adapter.create_invoice(&invoice_request(500_000)).await.unwrap_err();

        assert!(matches!(error, GatewayError::Rejected { status: 400, .. }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_paid_callback() {
        let session_id = Uuid::new_v4();
        let body = json!({
            "id": "inv_123",
            "external_id": format!("checkout_{}", session_id),
            "status": "PAID",
            "amount": 500000,
            "paid_amount": 500000,
            "payment_channel": "BCA",
            "paid_at": "2026-03-01T08:30:00.000Z",
        })
        .to_string();

        let event = adapter()
            .verify_and_parse(body.as_bytes(), &headers("callback-token"))
            .unwrap();

        assert_eq!(event.kind, PaymentEventKind::Paid);
        assert_eq!(event.session_id, session_id);
        assert_eq!(event.gateway_transaction_id.as_deref(), Some("inv_123"));
        assert_eq!(event.amount_received, Some(Decimal::from(500_000)));
        assert_eq!(event.payment_method.as_deref(), Some("BCA"));
        assert!(event.paid_at.is_some());
    }

    #[test]
    fn test_callback_token_mismatch() {
        let body = json!({
            "id": "inv_123",
            "external_id": format!("checkout_{}", Uuid::new_v4()),
            "status": "PAID",
        })
        .to_string();

        let adapter = adapter();
        assert!(matches!(
            adapter.verify_and_parse(body.as_bytes(), &headers("wrong")),
            Err(GatewayError::InvalidSignature)
        ));
        assert!(matches!(
            adapter.verify_and_parse(body.as_bytes(), &WebhookHeaders::new()),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[test]
    fn test_status_mapping() {
        let adapter = adapter();
        let parse = |status: &str| {
            let body = json!({
                "id": "inv_123",
                "external_id": format!("checkout_{}", Uuid::new_v4()),
                "status": status,
            })
            .to_string();
            adapter.verify_and_parse(body.as_bytes(), &headers("callback-token"))
        };

        assert_eq!(parse("SETTLED").unwrap().kind, PaymentEventKind::Paid);
        assert_eq!(parse("PENDING").unwrap().kind, PaymentEventKind::Pending);
        assert_eq!(parse("EXPIRED").unwrap().kind, PaymentEventKind::Expired);
        assert_eq!(parse("FAILED").unwrap().kind, PaymentEventKind::Failed);
        assert!(matches!(parse("REFUNDED"), Err(GatewayError::UnsupportedEvent(_))));
    }

    #[test]
    fn test_foreign_reference_rejected() {
        let body = json!({
            "id": "inv_123",
            "external_id": format!("HRIS-{}", Uuid::new_v4()),
            "status": "PAID",
        })
        .to_string();

        assert!(matches!(
            adapter().verify_and_parse(body.as_bytes(), &headers("callback-token")),
            Err(GatewayError::MalformedReference(_))
        ));
    }
}
