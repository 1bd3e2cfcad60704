pub mod checkout;
pub mod common;
pub mod notification;
pub mod payment;
pub mod plan;
pub mod subscription;
