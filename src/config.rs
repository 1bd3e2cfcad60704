use serde::{Deserialize, Serialize};
use std::env;

use crate::models::common::{Gateway, DEFAULT_CURRENCY};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub port: u16,
    pub xendit: Option<XenditConfig>,
    pub midtrans: Option<MidtransConfig>,
    pub tripay: Option<TripayConfig>,
    pub app: AppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `memory://` for the in-process store, otherwise a SurrealDB endpoint
    /// such as `mem://` or `http://localhost:8000`.
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XenditConfig {
    pub base_url: String,
    pub secret_key: String,
    pub callback_token: String,
    pub success_redirect_url: String,
    pub failure_redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidtransConfig {
    pub base_url: String,
    pub server_key: String,
    pub finish_redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripayConfig {
    pub base_url: String,
    pub api_key: String,
    pub private_key: String,
    pub merchant_code: String,
    pub default_method: String,
    pub return_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub trial_days: i64,
    pub checkout_expiry_hours: i64,
    pub trial_warning_days: Vec<i64>, // Remaining trial days that trigger a warning
    pub gateway_timeout_secs: u64,
    pub default_gateway: Gateway,
    pub currency: String,
    pub catalog_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let app = AppConfig::from_env();
        let success_redirect_url = env::var("SUCCESS_REDIRECT_URL")
            .unwrap_or_else(|_| "http://localhost:3000/billing/success".to_string());
        let failure_redirect_url = env::var("FAILURE_REDIRECT_URL")
            .unwrap_or_else(|_| "http://localhost:3000/billing/failed".to_string());

        let xendit = match env::var("XENDIT_SECRET_KEY") {
            Ok(secret_key) => Some(XenditConfig {
                base_url: env::var("XENDIT_BASE_URL")
                    .unwrap_or_else(|_| "https://api.xendit.co".to_string()),
                secret_key,
                callback_token: env::var("XENDIT_CALLBACK_TOKEN")?,
                success_redirect_url: success_redirect_url.clone(),
                failure_redirect_url: failure_redirect_url.clone(),
            }),
            Err(_) => None,
        };

        let midtrans = match env::var("MIDTRANS_SERVER_KEY") {
            Ok(server_key) => Some(MidtransConfig {
                base_url: env::var("MIDTRANS_BASE_URL")
                    .unwrap_or_else(|_| "https://app.sandbox.midtrans.com".to_string()),
                server_key,
                finish_redirect_url: success_redirect_url.clone(),
            }),
            Err(_) => None,
        };

        let tripay = match env::var("TRIPAY_API_KEY") {
            Ok(api_key) => Some(TripayConfig {
                base_url: env::var("TRIPAY_BASE_URL")
                    .unwrap_or_else(|_| "https://tripay.co.id/api-sandbox".to_string()),
                api_key,
                private_key: env::var("TRIPAY_PRIVATE_KEY")?,
                merchant_code: env::var("TRIPAY_MERCHANT_CODE")?,
                default_method: env::var("TRIPAY_DEFAULT_METHOD")
                    .unwrap_or_else(|_| "QRIS".to_string()),
                return_url: success_redirect_url,
            }),
            Err(_) => None,
        };

        Ok(Config {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "memory://".to_string()),
                namespace: env::var("DATABASE_NAMESPACE").unwrap_or_else(|_| "hris".to_string()),
                database: env::var("DATABASE_NAME").unwrap_or_else(|_| "billing".to_string()),
                username: env::var("DATABASE_USER").ok(),
                password: env::var("DATABASE_PASS").ok(),
            },
            port: env::var("PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(8080),
            xendit,
            midtrans,
            tripay,
            app,
        })
    }
}

impl AppConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trial_days: env::var("TRIAL_DAYS")
                .ok()
                .and_then(|days| days.parse().ok())
                .unwrap_or(defaults.trial_days),
            checkout_expiry_hours: env::var("CHECKOUT_EXPIRY_HOURS")
                .ok()
                .and_then(|hours| hours.parse().ok())
                .unwrap_or(defaults.checkout_expiry_hours),
            trial_warning_days: env::var("TRIAL_WARNING_DAYS")
                .map(|days| parse_day_list(&days))
                .unwrap_or(defaults.trial_warning_days),
            gateway_timeout_secs: env::var("GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|secs| secs.parse().ok())
                .unwrap_or(defaults.gateway_timeout_secs),
            default_gateway: env::var("DEFAULT_GATEWAY")
                .ok()
                .and_then(|gateway| gateway.parse().ok())
                .unwrap_or(defaults.default_gateway),
            currency: env::var("CURRENCY").unwrap_or(defaults.currency),
            catalog_path: env::var("CATALOG_PATH").ok(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            trial_days: 14,
            checkout_expiry_hours: 24,
            trial_warning_days: vec![7, 3, 1],
            gateway_timeout_secs: 30,
            default_gateway: Gateway::Midtrans,
            currency: DEFAULT_CURRENCY.to_string(),
            catalog_path: None,
        }
    }
}

fn parse_day_list(value: &str) -> Vec<i64> {
    value
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_list_parsing() {
        assert_eq!(parse_day_list("7, 3,1"), vec![7, 3, 1]);
        assert_eq!(parse_day_list("7,,x,2"), vec![7, 2]);
    }

    #[test]
    fn test_app_defaults() {
        let app = AppConfig::default();
        assert_eq!(app.trial_days, 14);
        assert_eq!(app.checkout_expiry_hours, 24);
        assert_eq!(app.trial_warning_days, vec![7, 3, 1]);
        assert_eq!(app.currency, "IDR");
    }
}
