//! Core identifier and status types shared by the gateway components.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// UserId
// =============================================================================

/// Internal user identity.
///
/// Users are created out of band by the registration flow; the gateway only
/// associates phone numbers with existing users and accounts usage to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// =============================================================================
// AttemptId / MappingId
// =============================================================================

/// Identifier of one logical SMS attempt row.
///
/// An attempt is created once per send or inbound and keeps its id across
/// retries; a retry swaps the carrier sid, never the attempt id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub i64);

impl AttemptId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl Display for AttemptId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AttemptId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Identifier of a phone ⇄ user mapping row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingId(pub i64);

impl MappingId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl Display for MappingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MappingId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// =============================================================================
// CarrierSid
// =============================================================================

/// Opaque message identifier assigned by the carrier.
///
/// Correlates an outbound send with its later status callbacks, and
/// deduplicates inbound webhook deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CarrierSid(String);

impl CarrierSid {
    pub fn new(sid: impl Into<String>) -> Self {
        Self(sid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CarrierSid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CarrierSid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CarrierSid {
    fn from(sid: String) -> Self {
        Self(sid)
    }
}

impl From<&str> for CarrierSid {
    fn from(sid: &str) -> Self {
        Self(sid.to_string())
    }
}

// =============================================================================
// Direction
// =============================================================================

/// Direction of an SMS attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error when parsing a persisted enum value.
#[derive(Debug, Clone, Error)]
#[error("unrecognized {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Direction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            other => Err(ParseEnumError {
                kind: "direction",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// FinalStatus
// =============================================================================

/// Lifecycle status of an attempt as tracked by the gateway.
///
/// `Delivered`, `Failed` and `Undelivered` are terminal: once reached, later
/// status callbacks never change the attempt again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Unknown,
    Sent,
    Delivered,
    Failed,
    Undelivered,
}

impl FinalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Undelivered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Undelivered => "undelivered",
        }
    }
}

impl Display for FinalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "undelivered" => Ok(Self::Undelivered),
            other => Err(ParseEnumError {
                kind: "final status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// YearMonth
// =============================================================================

/// Usage accounting period, rendered `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct YearMonth(String);

impl YearMonth {
    /// Period containing the given instant (UTC).
    pub fn of(at: DateTime<Utc>) -> Self {
        Self(format!("{:04}-{:02}", at.year(), at.month()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for YearMonth {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for YearMonth {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// SendKind
// =============================================================================

/// What an outbound message is for.
///
/// Verification-code sends bypass the opt-out block so an aborted sender can
/// still complete a later signup; everything else honors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    /// Reply produced by the agent runtime for a known user.
    AgentReply,
    /// Conversational reply from the onboarding state machine.
    Onboarding,
    /// Verification code delivery (exempt from opt-out).
    Verification,
    /// Fixed notices (MMS unsupported, agent fallback).
    Notice,
}

impl SendKind {
    pub fn bypasses_opt_out(self) -> bool {
        matches!(self, Self::Verification)
    }
}
