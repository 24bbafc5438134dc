//! Inbound message routing.
//!
//! One entry point per carrier webhook delivery: validate + normalize,
//! deduplicate, then hand the text to the agent runtime (known sender) or
//! the onboarding engine (unknown sender), and dispatch the reply as a
//! separate outbound send. All work for one phone number is serialized.

use crate::agent::AgentRuntime;
use crate::carrier::InboundWebhook;
use crate::dispatch::OutboundDispatcher;
use crate::onboarding::{OnboardingEngine, OnboardingError};
use crate::phone::PhoneNumber;
use crate::resolver::PhoneResolver;
use crate::store::StoreError;
use crate::store::usage::UsageStore;
use crate::sync::KeyedMutex;
use crate::types::{SendKind, UserId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixed reply when the agent runtime times out or fails.
pub const AGENT_FALLBACK: &str =
    "I'm having trouble right now, please try again in a minute.";

/// Fixed reply to inbound MMS.
pub const MMS_NOT_SUPPORTED: &str = "MMS is not supported, please send text only.";

/// Infrastructure failure while routing. The webhook adapter logs these and
/// still answers the carrier 200-empty (no retry amplification).
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Onboarding(#[from] OnboardingError),
}

/// Webhook-facing router wiring resolution, onboarding, the agent runtime
/// and the outbound dispatcher together.
pub struct InboundRouter {
    resolver: Arc<PhoneResolver>,
    engine: Arc<OnboardingEngine>,
    dispatcher: Arc<OutboundDispatcher>,
    usage: UsageStore,
    agent: Arc<dyn AgentRuntime>,
    locks: Arc<KeyedMutex>,
    agent_deadline: Duration,
}

impl InboundRouter {
    pub fn new(
        resolver: Arc<PhoneResolver>,
        engine: Arc<OnboardingEngine>,
        dispatcher: Arc<OutboundDispatcher>,
        usage: UsageStore,
        agent: Arc<dyn AgentRuntime>,
        locks: Arc<KeyedMutex>,
        agent_deadline: Duration,
    ) -> Self {
        Self {
            resolver,
            engine,
            dispatcher,
            usage,
            agent,
            locks,
            agent_deadline,
        }
    }

    /// Process one inbound SMS webhook delivery.
    ///
    /// Returns `Ok` for everything the carrier should not retry, including
    /// silently dropped traffic (invalid sender, duplicates).
    #[tracing::instrument(name = "InboundRouter::handle_inbound", skip_all, fields(sid = %payload.message_sid))]
    pub async fn handle_inbound(
        &self,
        payload: &InboundWebhook,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        let from = match PhoneNumber::normalize(&payload.from) {
            Ok(normalized) => normalized.number,
            Err(e) => {
                info!(from = %payload.from, error = %e, "dropping inbound with invalid sender");
                return Ok(());
            }
        };

        // Everything for one sender happens under that sender's lock, so
        // concurrent webhooks process in arrival order.
        let _guard = self.locks.lock(from.as_str()).await;

        if payload.num_media.unwrap_or(0) > 0 {
            debug!(from = %from, "inbound MMS; replying with notice");
            self.send_reply(None, &from, MMS_NOT_SUPPORTED, SendKind::Notice, now)
                .await;
            return Ok(());
        }

        // Carrier retry of a delivery we already ingested: ack and stop.
        if self
            .usage
            .find_inbound_by_sid(&payload.message_sid)
            .await?
            .is_some()
        {
            info!(sid = %payload.message_sid, "duplicate inbound delivery ignored");
            return Ok(());
        }

        let resolved = self.resolver.resolve(&from).await?;

        match self
            .dispatcher
            .record_inbound(
                resolved.map(|r| r.user_id),
                &from,
                &payload.body,
                &payload.message_sid,
                now,
            )
            .await
        {
            Ok(_) => {}
            // Lost the race against a concurrent duplicate.
            Err(StoreError::Conflict) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        match resolved {
            Some(user) => {
                let reply = self.agent_reply(user.user_id, &payload.body).await;
                self.send_reply(Some(user.user_id), &from, &reply, SendKind::AgentReply, now)
                    .await;
            }
            None => {
                let reply = self
                    .engine
                    .advance(&from, &payload.body, &payload.message_sid, now)
                    .await?;
                if reply.completed {
                    self.resolver.invalidate(&from);
                }
                self.send_reply(None, &from, &reply.body, SendKind::Onboarding, now)
                    .await;
            }
        }

        Ok(())
    }

    /// The registration collaborator reports a created account for a phone
    /// mid-onboarding: advance the session and send the verification code.
    #[tracing::instrument(name = "InboundRouter::handle_account_linked", skip_all, fields(user_id = %user_id))]
    pub async fn handle_account_linked(
        &self,
        phone_raw: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), RouterError> {
        let from = match PhoneNumber::normalize(phone_raw) {
            Ok(normalized) => normalized.number,
            Err(e) => {
                warn!(phone = phone_raw, error = %e, "account-linked hook with invalid phone");
                return Ok(());
            }
        };

        let _guard = self.locks.lock(from.as_str()).await;

        let reply = self.engine.account_linked(&from, user_id, now).await?;
        // A mapping row was created (or confirmed); any cached negative for
        // this phone is stale now.
        self.resolver.invalidate(&from);
        self.send_reply(Some(user_id), &from, &reply.body, SendKind::Verification, now)
            .await;
        Ok(())
    }

    async fn agent_reply(&self, user_id: UserId, text: &str) -> String {
        match tokio::time::timeout(self.agent_deadline, self.agent.handle(user_id, text)).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(user_id = %user_id, error = %e, "agent runtime failed; sending fallback");
                AGENT_FALLBACK.to_string()
            }
            Err(_) => {
                warn!(
                    user_id = %user_id,
                    deadline_secs = self.agent_deadline.as_secs(),
                    "agent runtime deadline exceeded; sending fallback"
                );
                AGENT_FALLBACK.to_string()
            }
        }
    }

    /// Dispatch a reply, downgrading send failures to log lines: the
    /// webhook must still be acknowledged, and policy refusals (opt-out,
    /// budget) are final.
    async fn send_reply(
        &self,
        user_id: Option<UserId>,
        to: &PhoneNumber,
        body: &str,
        kind: SendKind,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self.dispatcher.send(user_id, to, body, kind, now).await {
            warn!(to = %to, error = %e, "reply not sent");
        }
    }
}
