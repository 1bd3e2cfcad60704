use actix_web::web::Data;
use actix_web::HttpResponse;
use chrono::Utc;
use serde_json::json;

use crate::services::gateway::GatewayRegistry;

pub async fn health_check(gateways: Data<GatewayRegistry>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "hris-billing",
        "gateways": gateways.enabled(),
        "default_gateway": gateways.default_gateway(),
        "timestamp": Utc::now(),
    }))
}
