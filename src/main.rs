mod config;
mod error;
mod handlers;
mod models;
mod services;
mod tasks;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;

use services::{
    catalog,
    checkout::{CheckoutOrchestrator, CheckoutSettings},
    gateway::GatewayRegistry,
    notification::{LogNotifier, NotificationDispatcher},
    store,
    subscription::SubscriptionLifecycleManager,
    webhook::WebhookProcessor,
};
use tasks::BillingAutomationScheduler;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = config::Config::from_env().expect("Failed to load configuration");

    let store = store::connect(&config.database).await?;
    if let Some(path) = &config.app.catalog_path {
        catalog::load_catalog(store.as_ref(), path).await?;
    }

    let gateways = GatewayRegistry::from_config(&config)?;
    let notifications = NotificationDispatcher::spawn(Arc::new(LogNotifier));
    let lifecycle = SubscriptionLifecycleManager::new(config.app.trial_days);

    let checkout = CheckoutOrchestrator::new(
        store.clone(),
        gateways.clone(),
        lifecycle,
        CheckoutSettings::from_config(&config.app),
    );
    let processor = WebhookProcessor::new(store.clone(), lifecycle, notifications.clone());
    let scheduler = BillingAutomationScheduler::new(
        store.clone(),
        checkout.clone(),
        lifecycle,
        notifications,
        config.app.trial_warning_days.clone(),
    );

    let checkout = web::Data::new(checkout);
    let processor = web::Data::new(processor);
    let scheduler = web::Data::new(scheduler);
    let gateways = web::Data::new(gateways);

    let bind_address = format!("0.0.0.0:{}", config.port);
    log::info!("🚀 Starting HRIS billing service on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header(),
            )
            .app_data(checkout.clone())
            .app_data(processor.clone())
            .app_data(scheduler.clone())
            .app_data(gateways.clone())
            .service(web::scope("/api/v1").configure(handlers::configure))
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
