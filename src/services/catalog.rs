use anyhow::{bail, Context};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::models::plan::{SeatPlan, SubscriptionPlan};
use crate::services::store::BillingStore;

/// Plan catalog as stored in the JSON seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogFile {
    pub subscription_plans: Vec<SubscriptionPlan>,
    #[serde(default)]
    pub seat_plans: Vec<SeatPlan>,
}

pub fn parse_catalog(text: &str) -> anyhow::Result<CatalogFile> {
    let catalog: CatalogFile = serde_json::from_str(text).context("catalog is not valid JSON")?;

    let plan_ids: HashSet<_> = catalog.subscription_plans.iter().map(|plan| plan.id).collect();
    for seat_plan in &catalog.seat_plans {
        if !plan_ids.contains(&seat_plan.subscription_plan_id) {
            bail!(
                "seat plan {} references unknown subscription plan {}",
                seat_plan.name,
                seat_plan.subscription_plan_id
            );
        }
        if seat_plan.min_employees > seat_plan.max_employees {
            bail!("seat plan {} has min_employees above max_employees", seat_plan.name);
        }
        if seat_plan.price_per_month <= Decimal::ZERO || seat_plan.price_per_year <= Decimal::ZERO {
            bail!("seat plan {} must have positive prices", seat_plan.name);
        }
    }

    Ok(catalog)
}

pub async fn seed_catalog(store: &dyn BillingStore, catalog: CatalogFile) -> anyhow::Result<()> {
    let plans = catalog.subscription_plans.len();
    let seats = catalog.seat_plans.len();

    for plan in catalog.subscription_plans {
        store.upsert_subscription_plan(plan).await?;
    }
    for seat_plan in catalog.seat_plans {
        store.upsert_seat_plan(seat_plan).await?;
    }

    log::info!("📦 Catalog seeded: {} subscription plans, {} seat plans", plans, seats);
    Ok(())
}

pub async fn load_catalog(store: &dyn BillingStore, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let catalog = parse_catalog(&text).with_context(|| format!("invalid catalog {}", path.display()))?;
    seed_catalog(store, catalog).await
}
