use actix_web::web::{Bytes, Data, Path};
use actix_web::{post, HttpRequest, HttpResponse};
use serde_json::json;

use crate::error::BillingError;
use crate::models::common::{ApiResponse, Gateway};
use crate::services::gateway::{GatewayError, GatewayRegistry, WebhookHeaders};
use crate::services::webhook::WebhookProcessor;

// POST /webhooks/{gateway}
//
// The raw body is handed to the adapter untouched; signatures are computed
// over the exact bytes the gateway sent.
#[post("/{gateway}")]
pub async fn receive_webhook(
    req: HttpRequest,
    path: Path<String>,
    body: Bytes,
    gateways: Data<GatewayRegistry>,
    processor: Data<WebhookProcessor>,
) -> Result<HttpResponse, BillingError> {
    let name = path.into_inner();
    let gateway: Gateway = name
        .parse()
        .map_err(|_| BillingError::NotFound(format!("payment gateway {}", name)))?;
    let adapter = gateways.get(Some(gateway))?;

    let headers: WebhookHeaders = req
        .headers()
        .iter()
        .filter_map(|(header, value)| value.to_str().ok().map(|value| (header.as_str(), value)))
        .collect();

    let event = match adapter.verify_and_parse(&body, &headers) {
        Ok(event) => event,
        Err(GatewayError::UnsupportedEvent(kind)) => {
            log::info!("Ignoring {} webhook: {}", gateway, kind);
            return Ok(HttpResponse::Ok().json(ApiResponse::success(json!({ "outcome": "ignored" }))));
        }
        Err(e) => {
            log::warn!("⚠️ Rejected {} webhook: {}", gateway, e);
            return Err(e.into());
        }
    };

    log::info!(
        "📩 {} webhook {:?} for session {} ({})",
        gateway,
        event.kind,
        event.session_id,
        event.merchant_reference
    );

    let outcome = processor.process(&event).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(outcome)))
}
