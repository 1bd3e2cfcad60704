use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;
use validator::ValidationErrors;

use crate::models::common::ApiResponse;
use crate::services::gateway::GatewayError;
use crate::services::store::StoreError;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("payment gateway error: {0}")]
    Gateway(GatewayError),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
}

impl From<GatewayError> for BillingError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::InvalidSignature => BillingError::InvalidSignature,
            GatewayError::MalformedPayload(message) | GatewayError::UnsupportedEvent(message) => {
                BillingError::MalformedPayload(message)
            }
            GatewayError::MalformedReference(reference) => {
                BillingError::MalformedPayload(format!("unrecognised merchant reference {}", reference))
            }
            GatewayError::NotConfigured(gateway) => {
                BillingError::Validation(format!("payment gateway {} is not enabled", gateway))
            }
            other => BillingError::Gateway(other),
        }
    }
}

impl From<StoreError> for BillingError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => BillingError::NotFound(what),
            StoreError::Conflict { .. } | StoreError::DuplicateTransaction { .. } => {
                BillingError::Conflict(error.to_string())
            }
            StoreError::Backend(message) => BillingError::Store(message),
        }
    }
}

impl From<ValidationErrors> for BillingError {
    fn from(errors: ValidationErrors) -> Self {
        BillingError::Validation(errors.to_string())
    }
}

impl ResponseError for BillingError {
    fn status_code(&self) -> StatusCode {
        match self {
            BillingError::Validation(_) | BillingError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            BillingError::NotFound(_) => StatusCode::NOT_FOUND,
            BillingError::InvalidSignature => StatusCode::UNAUTHORIZED,
            BillingError::Gateway(GatewayError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            BillingError::Gateway(_) => StatusCode::BAD_GATEWAY,
            BillingError::Conflict(_) => StatusCode::CONFLICT,
            BillingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BillingError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ApiResponse::<()>::error(self.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::common::Gateway;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            BillingError::from(GatewayError::InvalidSignature).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            BillingError::from(GatewayError::Timeout).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            BillingError::from(GatewayError::MalformedReference("x".to_string())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BillingError::from(StoreError::NotFound("checkout session".to_string())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BillingError::from(StoreError::Backend("down".to_string())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            BillingError::from(GatewayError::NotConfigured(Gateway::Tripay)).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BillingError::Unavailable("checkout session was modified concurrently".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
