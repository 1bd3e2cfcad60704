use actix_web::web::Data;
use actix_web::{post, HttpResponse};
use chrono::Utc;

use crate::error::BillingError;
use crate::models::common::ApiResponse;
use crate::tasks::BillingAutomationScheduler;

// Cron entry points. Each call runs one sweep to completion.

#[post("/expire-trials")]
pub async fn expire_trials(scheduler: Data<BillingAutomationScheduler>) -> Result<HttpResponse, BillingError> {
    let report = scheduler.expire_trials(Utc::now()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(report)))
}

#[post("/trial-warnings")]
pub async fn trial_warnings(scheduler: Data<BillingAutomationScheduler>) -> Result<HttpResponse, BillingError> {
    let report = scheduler.send_trial_warnings(Utc::now()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(report)))
}

#[post("/renewals")]
pub async fn renewals(scheduler: Data<BillingAutomationScheduler>) -> Result<HttpResponse, BillingError> {
    let report = scheduler.process_renewals(Utc::now()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(report)))
}

#[post("/usage-snapshot")]
pub async fn usage_snapshot(scheduler: Data<BillingAutomationScheduler>) -> Result<HttpResponse, BillingError> {
    let report = scheduler.snapshot_usage(Utc::now()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(report)))
}

#[post("/expire-sessions")]
pub async fn expire_sessions(scheduler: Data<BillingAutomationScheduler>) -> Result<HttpResponse, BillingError> {
    let report = scheduler.expire_stale_sessions(Utc::now()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(report)))
}
