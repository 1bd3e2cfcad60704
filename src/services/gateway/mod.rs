pub mod midtrans;
pub mod tripay;
pub mod xendit;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::models::common::{CustomerContact, Gateway};

use self::midtrans::MidtransAdapter;
use self::tripay::TripayAdapter;
use self::xendit::XenditAdapter;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed gateway payload: {0}")]
    MalformedPayload(String),

    #[error("malformed merchant reference: {0}")]
    MalformedReference(String),

    #[error("unsupported gateway event: {0}")]
    UnsupportedEvent(String),

    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("payment gateway {0} is not configured")]
    NotConfigured(Gateway),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout | GatewayError::Transport(_) => true,
            GatewayError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            GatewayError::Timeout
        } else if error.is_decode() {
            GatewayError::MalformedPayload(error.to_string())
        } else {
            GatewayError::Transport(error.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEventKind {
    Paid,
    Pending,
    Expired,
    Failed,
}

/// Gateway notification translated into the shape the webhook processor
/// understands.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEvent {
    pub kind: PaymentEventKind,
    pub gateway: Gateway,
    pub merchant_reference: String,
    pub session_id: Uuid,
    pub gateway_transaction_id: Option<String>,
    pub amount_received: Option<Decimal>,
    pub payment_method: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub session_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub customer: CustomerContact,
    pub expires_at: DateTime<Utc>,
    pub payment_channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRef {
    pub provider_reference: String,
    pub redirect_url: String,
    pub token: Option<String>,
}

/// Request headers with lowercased names.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders(HashMap<String, String>);

impl WebhookHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for WebhookHeaders {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = WebhookHeaders::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn gateway(&self) -> Gateway;

    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<InvoiceRef, GatewayError>;

    /// Authenticates a notification and maps it to a `PaymentEvent`.
    /// Nothing is parsed into domain terms before the signature check passes.
    fn verify_and_parse(&self, body: &[u8], headers: &WebhookHeaders) -> Result<PaymentEvent, GatewayError>;
}

/// Maps checkout session ids to the merchant reference a gateway sees.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceScheme {
    prefix: &'static str,
}

impl ReferenceScheme {
    pub const fn new(prefix: &'static str) -> Self {
        Self { prefix }
    }

    pub fn encode(&self, session_id: Uuid) -> String {
        format!("{}{}", self.prefix, session_id)
    }

    /// Only the exact form produced by `encode` is accepted.
    pub fn decode(&self, reference: &str) -> Result<Uuid, GatewayError> {
        let malformed = || GatewayError::MalformedReference(reference.to_string());
        let raw = reference.strip_prefix(self.prefix).ok_or_else(malformed)?;
        let session_id = Uuid::parse_str(raw).map_err(|_| malformed())?;
        if self.encode(session_id) != reference {
            return Err(malformed());
        }
        Ok(session_id)
    }
}

#[derive(Clone)]
pub struct GatewayRegistry {
    adapters: HashMap<Gateway, Arc<dyn GatewayAdapter>>,
    default_gateway: Gateway,
}

impl GatewayRegistry {
    pub fn new(default_gateway: Gateway) -> Self {
        Self {
            adapters: HashMap::new(),
            default_gateway,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.adapters.insert(adapter.gateway(), adapter);
        self
    }

    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let timeout = Duration::from_secs(config.app.gateway_timeout_secs);
        let mut registry = GatewayRegistry::new(config.app.default_gateway);

        if let Some(xendit) = &config.xendit {
            registry = registry.with_adapter(Arc::new(XenditAdapter::new(xendit.clone(), timeout)?));
        }
        if let Some(midtrans) = &config.midtrans {
            registry = registry.with_adapter(Arc::new(MidtransAdapter::new(midtrans.clone(), timeout)?));
        }
        if let Some(tripay) = &config.tripay {
            registry = registry.with_adapter(Arc::new(TripayAdapter::new(tripay.clone(), timeout)?));
        }

        if !registry.adapters.contains_key(&registry.default_gateway) {
            log::warn!(
                "Default payment gateway {} is not configured; paid checkouts must name a gateway",
                registry.default_gateway
            );
        }
        log::info!("Enabled payment gateways: {:?}", registry.enabled());

        Ok(registry)
    }

    pub fn default_gateway(&self) -> Gateway {
        self.default_gateway
    }

    pub fn enabled(&self) -> Vec<Gateway> {
        let mut gateways: Vec<Gateway> = self.adapters.keys().copied().collect();
        gateways.sort_by_key(|gateway| gateway.to_string());
        gateways
    }

    pub fn get(&self, gateway: Option<Gateway>) -> Result<Arc<dyn GatewayAdapter>, GatewayError> {
        let gateway = gateway.unwrap_or(self.default_gateway);
        self.adapters
            .get(&gateway)
            .cloned()
            .ok_or(GatewayError::NotConfigured(gateway))
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<Client, GatewayError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(GatewayError::from)
}

pub(crate) fn sign_hmac_sha256(key: &str, payload: &[u8]) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| GatewayError::MalformedPayload("invalid signing key".to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn verify_hmac_sha256(key: &str, payload: &[u8], signature: &str) -> bool {
    let expected = match hex::decode(signature.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

pub(crate) fn constant_time_eq(left: &str, right: &str) -> bool {
    left.as_bytes().ct_eq(right.as_bytes()).into()
}

/// Rupiah amounts are sent without minor units.
pub(crate) fn whole_amount(amount: Decimal) -> Result<i64, GatewayError> {
    amount
        .round_dp(0)
        .to_i64()
        .ok_or_else(|| GatewayError::MalformedPayload(format!("amount {} out of range", amount)))
}

/// Gateways send money as JSON numbers or as strings.
pub(crate) fn parse_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        Value::String(text) => Decimal::from_str(text.trim()).ok(),
        _ => None,
    }
}

pub(crate) async fn rejection(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    GatewayError::Rejected { status, message }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::Mutex;

    /// Adapter double that records invoice requests and can be told to fail.
    pub struct StubGateway {
        pub gateway: Gateway,
        pub fail_with: Mutex<Option<GatewayError>>,
        pub requests: Mutex<Vec<InvoiceRequest>>,
    }

    impl StubGateway {
        pub fn new(gateway: Gateway) -> Self {
            Self {
                gateway,
                fail_with: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(gateway: Gateway, error: GatewayError) -> Self {
            let stub = Self::new(gateway);
            *stub.fail_with.lock().unwrap() = Some(error);
            stub
        }

        pub fn invoice_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GatewayAdapter for StubGateway {
        fn gateway(&self) -> Gateway {
            self.gateway
        }

        async fn create_invoice(&self, request: &InvoiceRequest) -> Result<InvoiceRef, GatewayError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(error) = self.fail_with.lock().unwrap().take() {
                return Err(error);
            }
            Ok(InvoiceRef {
                provider_reference: format!("inv-{}", request.session_id),
                redirect_url: format!("https://pay.example.com/{}", request.session_id),
                token: Some("snap-token".to_string()),
            })
        }

        fn verify_and_parse(&self, _body: &[u8], _headers: &WebhookHeaders) -> Result<PaymentEvent, GatewayError> {
            Err(GatewayError::UnsupportedEvent("stub".to_string()))
        }
    }

    pub fn invoice_request(amount: i64) -> InvoiceRequest {
        InvoiceRequest {
            session_id: Uuid::new_v4(),
            amount: Decimal::from(amount),
            currency: "IDR".to_string(),
            description: "HRIS Business 1-25 employees (monthly)".to_string(),
            customer: CustomerContact {
                name: "Siti Rahma".to_string(),
                email: "siti@example.co.id".to_string(),
                phone: Some("+628123456789".to_string()),
            },
            expires_at: Utc::now() + ChronoDuration::hours(24),
            payment_channel: None,
        }
    }

    #[test]
    fn test_reference_round_trip() {
        let scheme = ReferenceScheme::new("HRIS-");
        let session_id = Uuid::new_v4();
        let reference = scheme.encode(session_id);

        assert!(reference.starts_with("HRIS-"));
        assert_eq!(scheme.decode(&reference).unwrap(), session_id);
    }

    #[test]
    fn test_reference_rejects_foreign_forms() {
        let scheme = ReferenceScheme::new("checkout_");
        let session_id = Uuid::new_v4();

        assert!(matches!(
            scheme.decode(&format!("HRIS-{}", session_id)),
            Err(GatewayError::MalformedReference(_))
        ));
        assert!(scheme.decode("checkout_not-a-uuid").is_err());
        assert!(scheme.decode(&format!("checkout_{}", session_id.simple())).is_err());
        assert!(scheme
            .decode(&format!("checkout_{}", session_id.to_string().to_uppercase()))
            .is_err());
    }

    #[test]
    fn test_hmac_helpers() {
        let signature = sign_hmac_sha256("private", b"payload").unwrap();
        assert!(verify_hmac_sha256("private", b"payload", &signature));
        assert!(!verify_hmac_sha256("private", b"payload2", &signature));
        assert!(!verify_hmac_sha256("other", b"payload", &signature));
        assert!(!verify_hmac_sha256("private", b"payload", "zz"));
    }

    #[test]
    fn test_amount_helpers() {
        assert_eq!(whole_amount(Decimal::new(50000049, 2)).unwrap(), 500_000);
        assert_eq!(parse_amount(&json!(150000)), Some(Decimal::from(150_000)));
        assert_eq!(parse_amount(&json!("150000.00")), Some(Decimal::new(15000000, 2)));
        assert_eq!(parse_amount(&json!(null)), None);
        assert!(constant_time_eq("token", "token"));
        assert!(!constant_time_eq("token", "token2"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = GatewayRegistry::new(Gateway::Midtrans)
            .with_adapter(Arc::new(StubGateway::new(Gateway::Midtrans)));

        assert_eq!(registry.get(None).unwrap().gateway(), Gateway::Midtrans);
        assert!(matches!(
            registry.get(Some(Gateway::Xendit)),
            Err(GatewayError::NotConfigured(Gateway::Xendit))
        ));
        assert_eq!(registry.enabled(), vec![Gateway::Midtrans]);
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let headers: WebhookHeaders = vec![("X-CALLBACK-TOKEN", "abc")].into_iter().collect();
        assert_eq!(headers.get("x-callback-token"), Some("abc"));
        assert_eq!(headers.get("X-Callback-Token"), Some("abc"));
    }
}
