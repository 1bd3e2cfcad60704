pub mod automation;
pub mod checkout;
pub mod health;
pub mod subscription;
pub mod webhook;

use actix_web::web;

/// Routes mounted under `/api/v1`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/checkout")
            .service(checkout::initiate_trial)
            .service(checkout::complete_trial)
            .service(checkout::initiate_paid)
            .service(checkout::get_session),
    )
    .service(
        web::scope("/subscriptions")
            .service(subscription::preview_plan_change)
            .service(subscription::change_plan)
            .service(subscription::convert_trial)
            .service(subscription::get_subscription_status)
            .service(subscription::update_billing_info)
            .service(subscription::record_trial_usage),
    )
    .service(web::scope("/webhooks").service(webhook::receive_webhook))
    .service(
        web::scope("/automation")
            .service(automation::expire_trials)
            .service(automation::trial_warnings)
            .service(automation::renewals)
            .service(automation::usage_snapshot)
            .service(automation::expire_sessions),
    )
    .route("/health", web::get().to(health::health_check));
}
