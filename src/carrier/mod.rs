//! Carrier integration: REST client, webhook signature validation, typed
//! wire formats and error-code classification.

pub mod client;
pub mod signature;
pub mod types;

pub use client::{CarrierClient, CarrierClientBuilder, CarrierError};
pub use types::{
    ApiErrorBody, DeliveryStatus, ErrorCodeTable, InboundWebhook, SendReceipt, StatusWebhook,
};
