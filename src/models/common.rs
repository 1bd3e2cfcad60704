use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;

pub const DEFAULT_CURRENCY: &str = "IDR";

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            error: None,
        }
    }

    pub fn success_with_message(data: T, message: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message),
            error: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(error),
        }
    }
}

/// Payment providers a checkout can be settled through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Gateway {
    Xendit,
    Midtrans,
    Tripay,
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gateway::Xendit => write!(f, "xendit"),
            Gateway::Midtrans => write!(f, "midtrans"),
            Gateway::Tripay => write!(f, "tripay"),
        }
    }
}

impl FromStr for Gateway {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xendit" => Ok(Gateway::Xendit),
            "midtrans" => Ok(Gateway::Midtrans),
            "tripay" => Ok(Gateway::Tripay),
            other => Err(format!("unknown payment gateway: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn from_is_monthly(is_monthly: bool) -> Self {
        if is_monthly {
            BillingPeriod::Monthly
        } else {
            BillingPeriod::Yearly
        }
    }

    pub fn duration_days(&self) -> i64 {
        match self {
            BillingPeriod::Monthly => 30,
            BillingPeriod::Yearly => 365,
        }
    }

    /// Period implied by the length of a billing interval. Anything longer
    /// than a long month counts as yearly.
    pub fn from_interval_days(days: i64) -> Self {
        if days <= 31 {
            BillingPeriod::Monthly
        } else {
            BillingPeriod::Yearly
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingPeriod::Monthly => write!(f, "monthly"),
            BillingPeriod::Yearly => write!(f, "yearly"),
        }
    }
}

/// Payer details forwarded to the gateway when an invoice is created.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct CustomerContact {
    #[validate(length(min = 1, max = 100, message = "Customer name must be between 1 and 100 characters"))]
    pub name: String,

    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    pub phone: Option<String>,
}
