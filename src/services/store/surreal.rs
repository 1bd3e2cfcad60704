use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;
use surrealdb::{Response, Surreal};
use uuid::Uuid;

use super::{BillingStore, CommitReceipt, StoreError, UnitOfWork};
use crate::config::DatabaseConfig;
use crate::models::checkout::CheckoutSession;
use crate::models::common::Gateway;
use crate::models::notification::NotificationLog;
use crate::models::payment::PaymentTransaction;
use crate::models::plan::{SeatPlan, SubscriptionPlan};
use crate::models::subscription::{
    CustomerBillingInfo, Subscription, SubscriptionStatus, SubscriptionUsage, TrialActivity,
};

const SCHEMA: &str = "
    DEFINE TABLE IF NOT EXISTS subscription_plans SCHEMALESS;
    DEFINE TABLE IF NOT EXISTS seat_plans SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS seat_plan_parent ON seat_plans FIELDS plan_key;
    DEFINE TABLE IF NOT EXISTS checkout_sessions SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS checkout_session_open ON checkout_sessions FIELDS open, user_key;
    DEFINE TABLE IF NOT EXISTS subscriptions SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS subscription_owner ON subscriptions FIELDS user_key UNIQUE;
    DEFINE TABLE IF NOT EXISTS payment_transactions SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS payment_gateway_external ON payment_transactions FIELDS gateway, external_id UNIQUE;
    DEFINE INDEX IF NOT EXISTS payment_subscription ON payment_transactions FIELDS subscription_key;
    DEFINE TABLE IF NOT EXISTS trial_activities SCHEMALESS;
    DEFINE TABLE IF NOT EXISTS billing_info SCHEMALESS;
    DEFINE TABLE IF NOT EXISTS subscription_usage SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS usage_subscription ON subscription_usage FIELDS subscription_key;
    DEFINE TABLE IF NOT EXISTS notification_logs SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS notification_once ON notification_logs FIELDS dedupe_key UNIQUE;
";

/// SurrealDB-backed store. Each record keeps its domain document as JSON
/// text in `doc` next to the plain columns used for lookups and indexes.
#[derive(Clone)]
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl From<surrealdb::Error> for StoreError {
    fn from(error: surrealdb::Error) -> Self {
        StoreError::Backend(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Backend(format!("corrupt stored document: {}", error))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(Value::String(serde_json::to_string(value)?))
}

fn decode_all<T: DeserializeOwned>(docs: Vec<String>) -> Result<Vec<T>, StoreError> {
    docs.iter()
        .map(|doc| serde_json::from_str(doc).map_err(StoreError::from))
        .collect()
}

fn decode_first<T: DeserializeOwned>(docs: Vec<String>) -> Result<Option<T>, StoreError> {
    Ok(decode_all(docs)?.into_iter().next())
}

fn gateway_key(gateway: Gateway) -> String {
    gateway.to_string()
}

/// Version a record must currently have for a write to go through; an
/// empty list means it must not exist yet.
fn expected_rev(version: u64) -> Value {
    if version == 0 {
        json!([])
    } else {
        json!([version])
    }
}

fn classify(errors: Vec<String>) -> StoreError {
    let message = errors.join("; ");
    if message.contains("payment_gateway_external") {
        StoreError::Backend(message)
    } else if message.contains("conflict:") || message.contains("subscription_owner") {
        let entity = message
            .split("conflict:")
            .nth(1)
            .and_then(|rest| rest.split(|c: char| !c.is_alphanumeric() && c != '_').next())
            .unwrap_or("subscription")
            .to_string();
        StoreError::Conflict {
            entity,
            id: "concurrent write".to_string(),
        }
    } else {
        StoreError::Backend(message)
    }
}

fn check_errors(response: &mut Response) -> Result<(), StoreError> {
    let errors = response.take_errors();
    if errors.is_empty() {
        return Ok(());
    }
    let mut indexed: Vec<(usize, String)> = errors
        .into_iter()
        .map(|(index, error)| (index, error.to_string()))
        .collect();
    indexed.sort_by_key(|(index, _)| *index);
    Err(classify(indexed.into_iter().map(|(_, message)| message).collect()))
}

impl SurrealStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let db = any::connect(config.url.as_str()).await?;

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await?;
        }

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await?;

        let store = Self { db };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        let mut response = self.db.query(SCHEMA).await?;
        check_errors(&mut response)?;
        log::info!("Billing schema initialized");
        Ok(())
    }

    async fn select_docs(&self, query: &str, vars: BTreeMap<String, Value>) -> Result<Vec<String>, StoreError> {
        let mut response = self.db.query(query).bind(vars).await?;
        check_errors(&mut response)?;
        Ok(response.take::<Vec<String>>(0)?)
    }

    async fn execute(&self, query: String, vars: BTreeMap<String, Value>) -> Result<(), StoreError> {
        let mut response = self.db.query(query).bind(vars).await?;
        check_errors(&mut response)
    }

    async fn find_by_id<T: DeserializeOwned>(&self, table: &str, id: String) -> Result<Option<T>, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("table".to_string(), json!(table));
        vars.insert("id".to_string(), json!(id));
        let docs = self
            .select_docs("SELECT VALUE doc FROM type::thing($table, $id)", vars)
            .await?;
        decode_first(docs)
    }
}

#[async_trait]
impl BillingStore for SurrealStore {
    async fn upsert_subscription_plan(&self, plan: SubscriptionPlan) -> Result<(), StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("id".to_string(), json!(plan.id.to_string()));
        vars.insert("doc".to_string(), encode(&plan)?);
        self.execute(
            "UPSERT type::thing('subscription_plans', $id) CONTENT { doc: $doc };".to_string(),
            vars,
        )
        .await
    }

    async fn upsert_seat_plan(&self, plan: SeatPlan) -> Result<(), StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("id".to_string(), json!(plan.id.to_string()));
        vars.insert("plan".to_string(), json!(plan.subscription_plan_id.to_string()));
        vars.insert("doc".to_string(), encode(&plan)?);
        self.execute(
            "UPSERT type::thing('seat_plans', $id) CONTENT { doc: $doc, plan_key: $plan };".to_string(),
            vars,
        )
        .await
    }

    async fn get_subscription_plan(&self, id: Uuid) -> Result<Option<SubscriptionPlan>, StoreError> {
        self.find_by_id("subscription_plans", id.to_string()).await
    }

    async fn get_seat_plan(&self, id: Uuid) -> Result<Option<SeatPlan>, StoreError> {
        self.find_by_id("seat_plans", id.to_string()).await
    }

    async fn list_seat_plans(&self, subscription_plan_id: Uuid) -> Result<Vec<SeatPlan>, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("plan".to_string(), json!(subscription_plan_id.to_string()));
        let docs = self
            .select_docs("SELECT VALUE doc FROM seat_plans WHERE plan_key = $plan", vars)
            .await?;
        let mut plans: Vec<SeatPlan> = decode_all(docs)?;
        plans.sort_by_key(|plan| plan.min_employees);
        Ok(plans)
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<CheckoutSession>, StoreError> {
        self.find_by_id("checkout_sessions", id.to_string()).await
    }

    async fn list_open_sessions(&self) -> Result<Vec<CheckoutSession>, StoreError> {
        let docs = self
            .select_docs("SELECT VALUE doc FROM checkout_sessions WHERE open = true", BTreeMap::new())
            .await?;
        decode_all(docs)
    }

    async fn list_open_sessions_for_user(&self, user_id: Uuid) -> Result<Vec<CheckoutSession>, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("user".to_string(), json!(user_id.to_string()));
        let docs = self
            .select_docs(
                "SELECT VALUE doc FROM checkout_sessions WHERE open = true AND user_key = $user",
                vars,
            )
            .await?;
        decode_all(docs)
    }

    async fn get_subscription_by_user(&self, user_id: Uuid) -> Result<Option<Subscription>, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("user".to_string(), json!(user_id.to_string()));
        let docs = self
            .select_docs("SELECT VALUE doc FROM subscriptions WHERE user_key = $user", vars)
            .await?;
        decode_first(docs)
    }

    async fn list_subscriptions(&self, statuses: &[SubscriptionStatus]) -> Result<Vec<Subscription>, StoreError> {
        let keys: Vec<&str> = statuses.iter().map(SubscriptionStatus::as_str).collect();
        let mut vars = BTreeMap::new();
        vars.insert("statuses".to_string(), json!(keys));
        let docs = self
            .select_docs(
                "SELECT VALUE doc FROM subscriptions WHERE status_key INSIDE $statuses",
                vars,
            )
            .await?;
        decode_all(docs)
    }

    async fn find_transaction(
        &self,
        gateway: Gateway,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("gateway".to_string(), json!(gateway_key(gateway)));
        vars.insert("external_id".to_string(), json!(external_id));
        let docs = self
            .select_docs(
                "SELECT VALUE doc FROM payment_transactions WHERE gateway = $gateway AND external_id = $external_id",
                vars,
            )
            .await?;
        decode_first(docs)
    }

    async fn list_transactions(&self, subscription_id: Uuid) -> Result<Vec<PaymentTransaction>, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("subscription".to_string(), json!(subscription_id.to_string()));
        let docs = self
            .select_docs(
                "SELECT VALUE doc FROM payment_transactions WHERE subscription_key = $subscription",
                vars,
            )
            .await?;
        let mut transactions: Vec<PaymentTransaction> = decode_all(docs)?;
        transactions.sort_by_key(|txn| txn.created_at);
        Ok(transactions)
    }

    async fn get_trial_activity(&self, subscription_id: Uuid) -> Result<Option<TrialActivity>, StoreError> {
        self.find_by_id("trial_activities", subscription_id.to_string()).await
    }

    async fn get_billing_info(&self, subscription_id: Uuid) -> Result<Option<CustomerBillingInfo>, StoreError> {
        self.find_by_id("billing_info", subscription_id.to_string()).await
    }

    async fn append_usage(&self, usage: SubscriptionUsage) -> Result<(), StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("id".to_string(), json!(usage.id.to_string()));
        vars.insert("subscription".to_string(), json!(usage.subscription_id.to_string()));
        vars.insert("doc".to_string(), encode(&usage)?);
        self.execute(
            "CREATE type::thing('subscription_usage', $id) CONTENT { doc: $doc, subscription_key: $subscription };"
                .to_string(),
            vars,
        )
        .await
    }

    async fn list_usage(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionUsage>, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("subscription".to_string(), json!(subscription_id.to_string()));
        let docs = self
            .select_docs(
                "SELECT VALUE doc FROM subscription_usage WHERE subscription_key = $subscription",
                vars,
            )
            .await?;
        let mut usage: Vec<SubscriptionUsage> = decode_all(docs)?;
        usage.sort_by_key(|entry| entry.recorded_at);
        Ok(usage)
    }

    async fn record_notification(&self, log: NotificationLog) -> Result<bool, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("id".to_string(), json!(log.id.to_string()));
        vars.insert("key".to_string(), json!(log.dedupe_key()));
        vars.insert("doc".to_string(), encode(&log)?);
        let result = self
            .execute(
                "CREATE type::thing('notification_logs', $id) CONTENT { doc: $doc, dedupe_key: $key };".to_string(),
                vars,
            )
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(StoreError::Backend(message)) if message.contains("notification_once") => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn count_employees(&self, user_id: Uuid) -> Result<u32, StoreError> {
        let mut vars = BTreeMap::new();
        vars.insert("user".to_string(), json!(user_id.to_string()));
        let mut response = self
            .db
            .query("SELECT count() AS count FROM employees WHERE admin_user_id = $user GROUP ALL")
            .bind(vars)
            .await?;
        check_errors(&mut response)?;
        let rows: Vec<Value> = response.take(0)?;

        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(|count| count.as_u64())
            .unwrap_or(0) as u32)
    }

    async fn commit(&self, work: UnitOfWork) -> Result<CommitReceipt, StoreError> {
        let mut statements = vec!["BEGIN TRANSACTION;".to_string()];
        let mut vars = BTreeMap::new();
        let mut receipt = CommitReceipt::default();

        if let Some(mut session) = work.session {
            vars.insert("session_id".to_string(), json!(session.id.to_string()));
            vars.insert("session_expected".to_string(), expected_rev(session.version));
            session.version += 1;
            vars.insert("session_rev".to_string(), json!(session.version));
            vars.insert("session_user".to_string(), json!(session.user_id.to_string()));
            vars.insert("session_open".to_string(), json!(!session.status.is_terminal()));
            vars.insert("session_doc".to_string(), encode(&session)?);
            statements.push(
                "LET $session_current = (SELECT VALUE rev FROM type::thing('checkout_sessions', $session_id));
                 IF $session_current != $session_expected { THROW 'conflict:checkout_session' };
                 UPSERT type::thing('checkout_sessions', $session_id) CONTENT {
                     doc: $session_doc, rev: $session_rev, user_key: $session_user, open: $session_open
                 };"
                .to_string(),
            );
            receipt.session = Some(session);
        }

        if let Some(mut subscription) = work.subscription {
            vars.insert("subscription_id".to_string(), json!(subscription.id.to_string()));
            vars.insert("subscription_expected".to_string(), expected_rev(subscription.version));
            subscription.version += 1;
            vars.insert("subscription_rev".to_string(), json!(subscription.version));
            vars.insert("subscription_user".to_string(), json!(subscription.user_id.to_string()));
            vars.insert("subscription_status".to_string(), json!(subscription.status.as_str()));
            vars.insert("subscription_doc".to_string(), encode(&subscription)?);
            statements.push(
                "LET $subscription_current = (SELECT VALUE rev FROM type::thing('subscriptions', $subscription_id));
                 IF $subscription_current != $subscription_expected { THROW 'conflict:subscription' };
                 UPSERT type::thing('subscriptions', $subscription_id) CONTENT {
                     doc: $subscription_doc, rev: $subscription_rev,
                     user_key: $subscription_user, status_key: $subscription_status
                 };"
                .to_string(),
            );
            receipt.subscription = Some(subscription);
        }

        let mut duplicate = None;
        if let Some(transaction) = &work.transaction {
            duplicate = Some((transaction.gateway, transaction.gateway_external_id.clone()));
            vars.insert("txn_id".to_string(), json!(transaction.id.to_string()));
            vars.insert("txn_gateway".to_string(), json!(gateway_key(transaction.gateway)));
            vars.insert("txn_external".to_string(), json!(transaction.gateway_external_id));
            vars.insert(
                "txn_subscription".to_string(),
                json!(transaction.subscription_id.map(|id| id.to_string())),
            );
            vars.insert("txn_doc".to_string(), encode(transaction)?);
            statements.push(
                "CREATE type::thing('payment_transactions', $txn_id) CONTENT {
                     doc: $txn_doc, gateway: $txn_gateway, external_id: $txn_external,
                     subscription_key: $txn_subscription
                 };"
                .to_string(),
            );
        }

        if let Some(mut activity) = work.trial_activity {
            vars.insert("trial_key".to_string(), json!(activity.subscription_id.to_string()));
            vars.insert("trial_expected".to_string(), expected_rev(activity.version));
            activity.version += 1;
            vars.insert("trial_rev".to_string(), json!(activity.version));
            vars.insert("trial_doc".to_string(), encode(&activity)?);
            statements.push(
                "LET $trial_current = (SELECT VALUE rev FROM type::thing('trial_activities', $trial_key));
                 IF $trial_current != $trial_expected { THROW 'conflict:trial_activity' };
                 UPSERT type::thing('trial_activities', $trial_key) CONTENT { doc: $trial_doc, rev: $trial_rev };"
                    .to_string(),
            );
            receipt.trial_activity = Some(activity);
        }

        if let Some(mut info) = work.billing_info {
            vars.insert("billing_key".to_string(), json!(info.subscription_id.to_string()));
            vars.insert("billing_expected".to_string(), expected_rev(info.version));
            info.version += 1;
            vars.insert("billing_rev".to_string(), json!(info.version));
            vars.insert("billing_doc".to_string(), encode(&info)?);
            statements.push(
                "LET $billing_current = (SELECT VALUE rev FROM type::thing('billing_info', $billing_key));
                 IF $billing_current != $billing_expected { THROW 'conflict:billing_info' };
                 UPSERT type::thing('billing_info', $billing_key) CONTENT { doc: $billing_doc, rev: $billing_rev };"
                    .to_string(),
            );
            receipt.billing_info = Some(info);
        }

        statements.push("COMMIT TRANSACTION;".to_string());

        match self.execute(statements.join("\n"), vars).await {
            Ok(()) => Ok(receipt),
            Err(StoreError::Backend(message)) if message.contains("payment_gateway_external") => {
                let (gateway, external_id) = duplicate
                    .ok_or_else(|| StoreError::Backend(message.clone()))?;
                Err(StoreError::DuplicateTransaction { gateway, external_id })
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::tests::{exercise_commit_contract, exercise_notification_dedupe};

    async fn embedded() -> SurrealStore {
        SurrealStore::connect(&DatabaseConfig {
            url: "mem://".to_string(),
            namespace: "hris".to_string(),
            database: format!("billing_{}", Uuid::new_v4().simple()),
            username: None,
            password: None,
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classify(vec!["An error occurred: conflict:checkout_session".to_string()]),
            StoreError::Conflict { entity, .. } if entity == "checkout_session"
        ));
        assert!(matches!(
            classify(vec!["Database index `subscription_owner` already contains 'abc'".to_string()]),
            StoreError::Conflict { .. }
        ));
        assert!(matches!(
            classify(vec!["connection reset".to_string()]),
            StoreError::Backend(_)
        ));
    }

    #[tokio::test]
    async fn test_commit_contract() {
        exercise_commit_contract(&embedded().await).await;
    }

    #[tokio::test]
    async fn test_notification_dedupe() {
        exercise_notification_dedupe(&embedded().await).await;
    }
}
