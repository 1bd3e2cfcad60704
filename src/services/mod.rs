pub mod catalog;
pub mod checkout;
pub mod gateway;
pub mod notification;
pub mod store;
pub mod subscription;
pub mod webhook;

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use uuid::Uuid;

    use crate::models::checkout::{CheckoutPurpose, CheckoutSession, NewPaidCheckout};
    use crate::models::common::{BillingPeriod, CustomerContact, Gateway};
    use crate::models::plan::{SeatPlan, SubscriptionPlan};
    use crate::services::store::{BillingStore, MemoryStore, UnitOfWork};

    /// Two plans, each with a small and a large seat band.
    pub struct Catalog {
        pub basic: Uuid,
        pub pro: Uuid,
        pub basic_small: SeatPlan,
        pub basic_large: SeatPlan,
        pub pro_small: SeatPlan,
        pub pro_large: SeatPlan,
    }

    fn seat(plan: Uuid, name: &str, min: u32, max: u32, monthly: i64) -> SeatPlan {
        SeatPlan {
            id: Uuid::new_v4(),
            subscription_plan_id: plan,
            name: name.to_string(),
            min_employees: min,
            max_employees: max,
            price_per_month: Decimal::from(monthly),
            price_per_year: Decimal::from(monthly * 10),
            is_active: true,
        }
    }

    pub async fn seed(store: &MemoryStore) -> Catalog {
        let basic = Uuid::new_v4();
        let pro = Uuid::new_v4();
        let catalog = Catalog {
            basic,
            pro,
            basic_small: seat(basic, "Basic 1-25", 1, 25, 500_000),
            basic_large: seat(basic, "Basic 26-100", 26, 100, 1_000_000),
            pro_small: seat(pro, "Pro 1-25", 1, 25, 750_000),
            pro_large: seat(pro, "Pro 26-100", 26, 100, 1_500_000),
        };

        for (id, name) in [(basic, "Basic"), (pro, "Pro")] {
            store
                .upsert_subscription_plan(SubscriptionPlan {
                    id,
                    name: name.to_string(),
                    description: None,
                    is_active: true,
                })
                .await
                .unwrap();
        }
        for seat in [
            &catalog.basic_small,
            &catalog.basic_large,
            &catalog.pro_small,
            &catalog.pro_large,
        ] {
            store.upsert_seat_plan(seat.clone()).await.unwrap();
        }

        catalog
    }

    pub fn customer() -> CustomerContact {
        CustomerContact {
            name: "Rina Wijaya".to_string(),
            email: "rina@example.co.id".to_string(),
            phone: Some("+6281234567890".to_string()),
        }
    }

    /// Stores a paid session that already has its invoice attached.
    pub async fn pending_session(
        store: &dyn BillingStore,
        user_id: Uuid,
        seat_plan: &SeatPlan,
        purpose: CheckoutPurpose,
        amount: Decimal,
        gateway: Gateway,
        now: DateTime<Utc>,
    ) -> CheckoutSession {
        let mut session = CheckoutSession::new_paid(
            NewPaidCheckout {
                user_id,
                subscription_plan_id: seat_plan.subscription_plan_id,
                seat_plan_id: seat_plan.id,
                purpose,
                source_seat_plan_id: None,
                amount,
                currency: "IDR".to_string(),
                billing_period: BillingPeriod::Monthly,
                gateway,
                customer: customer(),
            },
            Duration::hours(24),
            now,
        )
        .unwrap();
        session
            .attach_invoice(format!("inv-{}", session.id), "https://pay.example.com".to_string(), None)
            .unwrap();

        store
            .commit(UnitOfWork::new().session(session))
            .await
            .unwrap()
            .session
            .unwrap()
    }

    pub fn shared(store: &MemoryStore) -> Arc<dyn BillingStore> {
        Arc::new(store.clone())
    }
}
