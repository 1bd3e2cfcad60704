use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::common::BillingPeriod;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
}

/// Priced employee band inside a subscription plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeatPlan {
    pub id: Uuid,
    pub subscription_plan_id: Uuid,
    pub name: String,
    pub min_employees: u32,
    pub max_employees: u32,
    pub price_per_month: Decimal,
    pub price_per_year: Decimal,
    pub is_active: bool,
}

impl SeatPlan {
    pub fn price(&self, period: BillingPeriod) -> Decimal {
        match period {
            BillingPeriod::Monthly => self.price_per_month,
            BillingPeriod::Yearly => self.price_per_year,
        }
    }

    pub fn covers(&self, employee_count: u32) -> bool {
        employee_count <= self.max_employees
    }

    pub fn same_band(&self, other: &SeatPlan) -> bool {
        self.min_employees == other.min_employees && self.max_employees == other.max_employees
    }
}
