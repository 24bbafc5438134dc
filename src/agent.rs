//! The agent runtime boundary.
//!
//! The gateway treats reply generation as an opaque capability: it may take
//! seconds, it may fail, and the router bounds every call with a deadline.

use crate::types::UserId;
use async_trait::async_trait;
use thiserror::Error;

/// Error from the agent runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent runtime failed: {0}")]
    Failed(String),
}

/// Produces the reply for a known user's inbound message.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn handle(&self, user_id: UserId, text: &str) -> Result<String, AgentError>;
}
