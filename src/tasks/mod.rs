pub mod billing_automation;

pub use self::billing_automation::{BillingAutomationScheduler, SweepReport};
