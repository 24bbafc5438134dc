//! # SMS Gateway
//!
//! A multi-tenant SMS gateway and conversation router. One carrier phone
//! number receives all inbound traffic; the gateway resolves each sender to
//! an internal user, routes known senders to an agent runtime and unknown
//! senders through a conversational onboarding flow, sends replies back
//! through the carrier, and reconciles delivery outcomes from asynchronous
//! status webhooks.
//!
//! ## Architecture
//!
//! ```text
//!  CarrierWebhook ──► http ──► InboundRouter ──► PhoneResolver ──► IdentityStore
//!                                   │
//!                     ┌─────────────┴──────────────┐
//!                     ▼                            ▼
//!              AgentRuntime (known)      OnboardingEngine (unknown)
//!                     │                            │
//!                     └─────────────┬──────────────┘
//!                                   ▼
//!                          OutboundDispatcher ──► CarrierClient
//!                                   │
//!  CarrierStatusWebhook ────────────┘ (reconcile, retry, usage)
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use sms_gateway::config::GatewayConfig;
//! use sms_gateway::store::Database;
//!
//! let config = GatewayConfig::from_env()?;
//! let db = Database::connect(&config.database_url).await?;
//! // see src/main.rs for the full composition root
//! ```
//!
//! Everything is constructed once at startup and passed by reference; there
//! is no global mutable state.

pub mod agent;
pub mod carrier;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod http;
pub mod onboarding;
pub mod phone;
pub mod resolver;
pub mod router;
pub mod store;
pub mod sync;
pub mod types;

// Re-export the commonly wired types at the crate root.
pub use agent::{AgentError, AgentRuntime};
pub use carrier::{CarrierClient, CarrierError};
pub use config::GatewayConfig;
pub use dispatch::{OutboundDispatcher, SendError};
pub use errors::{ClassifyError, ErrorClass};
pub use onboarding::{EngineReply, OnboardingEngine};
pub use phone::{PhoneError, PhoneNumber};
pub use resolver::PhoneResolver;
pub use router::InboundRouter;
pub use store::Database;
pub use types::{AttemptId, CarrierSid, Direction, FinalStatus, SendKind, UserId, YearMonth};
