//! Typed carrier wire formats.
//!
//! Webhook bodies are parsed exactly once into these structs; no raw form
//! maps travel past the HTTP adapter.

use crate::errors::ErrorClass;
use crate::types::CarrierSid;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

// =============================================================================
// Delivery status
// =============================================================================

/// Message status as reported by the carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Accepted,
    Queued,
    Sending,
    Sent,
    Receiving,
    Received,
    Delivered,
    Failed,
    Undelivered,
}

impl DeliveryStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accepted" => Some(Self::Accepted),
            "queued" => Some(Self::Queued),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "receiving" => Some(Self::Receiving),
            "received" => Some(Self::Received),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "undelivered" => Some(Self::Undelivered),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Receiving => "receiving",
            Self::Received => "received",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Undelivered => "undelivered",
        }
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Webhook payloads
// =============================================================================

/// Inbound SMS webhook body (`POST /sms/inbound`, form-urlencoded).
#[derive(Debug, Clone, Deserialize)]
pub struct InboundWebhook {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "MessageSid")]
    pub message_sid: CarrierSid,
    #[serde(rename = "AccountSid")]
    pub account_sid: String,
    #[serde(rename = "NumMedia", default)]
    pub num_media: Option<u32>,
    #[serde(rename = "FromCountry", default)]
    pub from_country: Option<String>,
}

/// Status callback webhook body (`POST /sms/status`, form-urlencoded).
#[derive(Debug, Clone, Deserialize)]
pub struct StatusWebhook {
    #[serde(rename = "MessageSid")]
    pub message_sid: CarrierSid,
    #[serde(rename = "MessageStatus")]
    pub message_status: String,
    #[serde(rename = "ErrorCode", default)]
    pub error_code: Option<String>,
}

/// Successful response body for the carrier's send endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SendReceipt {
    pub sid: CarrierSid,
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
}

/// Error response body from the carrier REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Error-code classification
// =============================================================================

/// Carrier error-code → transient/permanent mapping.
///
/// The enumerated sets cover the carrier's documented codes; deployments can
/// extend the transient set through configuration. Codes in neither set are
/// treated as permanent, and a failure without a code as transient
/// (carrier-side, cause unknown).
#[derive(Debug, Clone)]
pub struct ErrorCodeTable {
    transient: HashSet<String>,
    permanent: HashSet<String>,
}

impl Default for ErrorCodeTable {
    fn default() -> Self {
        let transient = ["30001", "30003", "30022", "20429"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let permanent = [
            // invalid number, unsubscribed, landline / not a mobile,
            // blocked, unknown destination, account suspended
            "21211", "21610", "21614", "30004", "30005", "30006", "20003",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        Self {
            transient,
            permanent,
        }
    }
}

impl ErrorCodeTable {
    /// Add deployment-specific transient codes.
    pub fn with_transient(mut self, codes: impl IntoIterator<Item = String>) -> Self {
        self.transient.extend(codes);
        self
    }

    pub fn classify(&self, code: Option<&str>) -> ErrorClass {
        match code {
            None => ErrorClass::Transient,
            Some(c) if self.transient.contains(c) => ErrorClass::Transient,
            Some(_) => ErrorClass::Permanent,
        }
    }
}
