use actix_web::web::{Data, Json, Path};
use actix_web::{get, post, put, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use crate::error::BillingError;
use crate::models::checkout::{ConvertTrialRequest, PlanChangeRequest};
use crate::models::common::ApiResponse;
use crate::models::subscription::BillingInfoInput;
use crate::services::checkout::{CheckoutOrchestrator, PlanChangeResult};

#[derive(Debug, Deserialize)]
pub struct PlanChangePreviewRequest {
    pub user_id: Uuid,
    pub new_subscription_plan_id: Option<Uuid>,
    pub new_seat_plan_id: Option<Uuid>,
    pub is_monthly: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TrialUsageRequest {
    #[validate(length(min = 1, max = 100, message = "Feature must be between 1 and 100 characters"))]
    pub feature: String,
}

// GET /subscriptions/{user_id}
#[get("/{user_id}")]
pub async fn get_subscription_status(
    checkout: Data<CheckoutOrchestrator>,
    path: Path<Uuid>,
) -> Result<HttpResponse, BillingError> {
    let subscription = checkout.subscription_status(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(subscription.to_status_response(Utc::now()))))
}

// POST /subscriptions/plan-change/preview
#[post("/plan-change/preview")]
pub async fn preview_plan_change(
    checkout: Data<CheckoutOrchestrator>,
    payload: Json<PlanChangePreviewRequest>,
) -> Result<HttpResponse, BillingError> {
    let preview = checkout
        .preview_plan_change(
            payload.user_id,
            payload.new_subscription_plan_id,
            payload.new_seat_plan_id,
            payload.is_monthly,
        )
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(preview)))
}

// POST /subscriptions/plan-change
#[post("/plan-change")]
pub async fn change_plan(
    checkout: Data<CheckoutOrchestrator>,
    payload: Json<PlanChangeRequest>,
) -> Result<HttpResponse, BillingError> {
    payload.validate()?;
    let now = Utc::now();

    match checkout.change_plan(payload.into_inner(), now).await? {
        PlanChangeResult::PaymentRequired { session } => Ok(HttpResponse::Created().json(
            ApiResponse::success_with_message(
                json!({ "result": "payment_required", "session": session.to_response(now) }),
                "Complete the payment to switch plans".to_string(),
            ),
        )),
        PlanChangeResult::Applied { subscription } => Ok(HttpResponse::Ok().json(ApiResponse::success(
            json!({ "result": "applied", "subscription": subscription.to_status_response(now) }),
        ))),
    }
}

// POST /subscriptions/convert
#[post("/convert")]
pub async fn convert_trial(
    checkout: Data<CheckoutOrchestrator>,
    payload: Json<ConvertTrialRequest>,
) -> Result<HttpResponse, BillingError> {
    payload.validate()?;
    let now = Utc::now();

    let session = checkout.convert_trial_to_paid(payload.into_inner(), now).await?;
    Ok(HttpResponse::Created().json(ApiResponse::success(session.to_response(now))))
}

// PUT /subscriptions/{user_id}/billing-info
#[put("/{user_id}/billing-info")]
pub async fn update_billing_info(
    checkout: Data<CheckoutOrchestrator>,
    path: Path<Uuid>,
    payload: Json<BillingInfoInput>,
) -> Result<HttpResponse, BillingError> {
    payload.validate()?;

    let info = checkout
        .update_billing_info(path.into_inner(), payload.into_inner(), Utc::now())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(info)))
}

// POST /subscriptions/{user_id}/trial-usage
#[post("/{user_id}/trial-usage")]
pub async fn record_trial_usage(
    checkout: Data<CheckoutOrchestrator>,
    path: Path<Uuid>,
    payload: Json<TrialUsageRequest>,
) -> Result<HttpResponse, BillingError> {
    payload.validate()?;

    let activity = checkout
        .record_trial_feature_usage(path.into_inner(), &payload.feature, Utc::now())
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(activity)))
}
