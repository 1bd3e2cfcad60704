use actix_web::web::{Data, Json, Path};
use actix_web::{get, post, HttpResponse};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::error::BillingError;
use crate::models::checkout::{CompleteTrialRequest, PaidCheckoutRequest, TrialCheckoutRequest};
use crate::models::common::ApiResponse;
use crate::services::checkout::CheckoutOrchestrator;

// POST /checkout/trial
#[post("/trial")]
pub async fn initiate_trial(
    checkout: Data<CheckoutOrchestrator>,
    payload: Json<TrialCheckoutRequest>,
) -> Result<HttpResponse, BillingError> {
    payload.validate()?;
    let now = Utc::now();

    let session = checkout
        .initiate_trial(payload.user_id, payload.subscription_plan_id, payload.seat_plan_id, now)
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::success(session.to_response(now))))
}

// POST /checkout/trial/{session_id}/complete
#[post("/trial/{session_id}/complete")]
pub async fn complete_trial(
    checkout: Data<CheckoutOrchestrator>,
    path: Path<Uuid>,
    payload: Json<CompleteTrialRequest>,
) -> Result<HttpResponse, BillingError> {
    payload.validate()?;
    let now = Utc::now();

    let (session, subscription) = checkout
        .complete_trial_checkout(path.into_inner(), payload.into_inner().billing_info, now)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::success_with_message(
        json!({
            "session": session.to_response(now),
            "subscription": subscription.to_status_response(now),
        }),
        format!(
            "Trial active with {} days remaining",
            subscription.remaining_trial_days(now)
        ),
    )))
}

// POST /checkout/paid
#[post("/paid")]
pub async fn initiate_paid(
    checkout: Data<CheckoutOrchestrator>,
    payload: Json<PaidCheckoutRequest>,
) -> Result<HttpResponse, BillingError> {
    payload.validate()?;
    let now = Utc::now();

    let session = checkout.initiate_paid(payload.into_inner(), now).await?;
    Ok(HttpResponse::Created().json(ApiResponse::success(session.to_response(now))))
}

// GET /checkout/{session_id}
#[get("/{session_id}")]
pub async fn get_session(
    checkout: Data<CheckoutOrchestrator>,
    path: Path<Uuid>,
) -> Result<HttpResponse, BillingError> {
    let session = checkout.get_session(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(session.to_response(Utc::now()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::checkout::CheckoutSessionResponse;
    use crate::models::common::Gateway;
    use crate::services::checkout::CheckoutSettings;
    use crate::services::fixtures::{seed, shared};
    use crate::services::gateway::tests::StubGateway;
    use crate::services::gateway::GatewayRegistry;
    use crate::services::store::MemoryStore;
    use crate::services::subscription::SubscriptionLifecycleManager;
    use actix_web::{http::StatusCode, test, App};
    use chrono::Duration;
    use serde_json::Value;
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_trial_flow_over_http() {
        let store = MemoryStore::new();
        let catalog = seed(&store).await;
        let checkout = CheckoutOrchestrator::new(
            shared(&store),
            GatewayRegistry::new(Gateway::Midtrans).with_adapter(Arc::new(StubGateway::new(Gateway::Midtrans))),
            SubscriptionLifecycleManager::new(14),
            CheckoutSettings {
                currency: "IDR".to_string(),
                session_ttl: Duration::hours(24),
            },
        );
        let app = test::init_service(
            App::new()
                .app_data(Data::new(checkout))
                .service(
                    actix_web::web::scope("/checkout")
                        .service(initiate_trial)
                        .service(complete_trial)
                        .service(get_session),
                ),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/checkout/trial")
            .set_json(json!({
                "user_id": Uuid::new_v4(),
                "subscription_plan_id": catalog.basic,
                "seat_plan_id": catalog.basic_small.id,
            }))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(response).await;
        let session: CheckoutSessionResponse = serde_json::from_value(body["data"].clone()).unwrap();
        assert!(session.is_trial_checkout);

        let request = test::TestRequest::post()
            .uri(&format!("/checkout/trial/{}/complete", session.session_id))
            .set_json(json!({}))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = test::read_body_json(response).await;
        assert_eq!(body["data"]["subscription"]["status"], "trial");
        assert_eq!(body["data"]["subscription"]["remaining_trial_days"], 14);

        let request = test::TestRequest::get()
            .uri(&format!("/checkout/{}", Uuid::new_v4()))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
