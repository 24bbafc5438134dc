//! Interactive onboarding for senders without a verified mapping.
//!
//! One TTL'd session per phone number walks the sender through consent,
//! email, name, signup and phone verification. Transitions are idempotent
//! under carrier webhook retries: each session remembers the last processed
//! message sid and replays its reply instead of re-applying the transition.

use crate::config::OnboardingConfig;
use crate::phone::PhoneNumber;
use crate::store::StoreError;
use crate::store::identity::{IdentityError, IdentityStore, VerificationError};
use crate::store::onboarding::{OnboardingSession, OnboardingStep, OnboardingStore};
use crate::types::{CarrierSid, UserId};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Longest accepted full name.
const MAX_NAME_CHARS: usize = 100;

static CONSENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(yes|y|ok)$").expect("static regex")
});

static STOP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^stop$").expect("static regex"));

/// Practical RFC-5322 shape: local part, '@', dotted domain labels.
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$",
    )
    .expect("static regex")
});

/// Error from the onboarding engine.
///
/// Bad sender input is never an error: it becomes a conversational reply.
/// These are infrastructure failures the router logs and swallows.
#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("identity operation failed: {0}")]
    Identity(#[from] IdentityError),
}

/// Outcome of one engine call: the text to send back, plus whether this
/// call finished onboarding (callers invalidate the resolver cache then).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineReply {
    pub body: String,
    pub completed: bool,
}

impl EngineReply {
    fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            completed: false,
        }
    }
}

/// The per-phone onboarding state machine.
pub struct OnboardingEngine {
    sessions: OnboardingStore,
    identity: IdentityStore,
    config: OnboardingConfig,
}

impl OnboardingEngine {
    pub fn new(
        sessions: OnboardingStore,
        identity: IdentityStore,
        config: OnboardingConfig,
    ) -> Self {
        Self {
            sessions,
            identity,
            config,
        }
    }

    /// Apply one inbound message to the sender's session.
    ///
    /// Always produces a reply. An expired or missing session restarts the
    /// conversation at `welcome`.
    #[tracing::instrument(name = "OnboardingEngine::advance", skip_all, fields(phone = %phone, sid = %message_sid))]
    pub async fn advance(
        &self,
        phone: &PhoneNumber,
        text: &str,
        message_sid: &CarrierSid,
        now: DateTime<Utc>,
    ) -> Result<EngineReply, OnboardingError> {
        let mut session = match self.sessions.find_active(phone, now).await? {
            Some(session) if !session.step.is_terminal() => session,
            _ => {
                self.sessions
                    .create(phone, self.config.session_ttl, now)
                    .await?
            }
        };

        // Carrier retry of an already-consumed message: replay the reply.
        if session.last_processed_sid.as_ref() == Some(message_sid) {
            if let Some(reply) = session.last_reply.clone() {
                info!("replaying reply for retried message");
                return Ok(EngineReply::text(reply));
            }
        }

        let trimmed = text.trim();
        let keyword = trimmed.to_lowercase();

        let reply = match session.step {
            OnboardingStep::Welcome => {
                session.step = OnboardingStep::AwaitingConsent;
                EngineReply::text(replies::WELCOME)
            }
            OnboardingStep::AwaitingConsent => {
                if STOP_RE.is_match(&keyword) {
                    return self.abort_opted_out(&mut session, message_sid, now).await;
                } else if CONSENT_RE.is_match(&keyword) {
                    session.step = OnboardingStep::AwaitingEmail;
                    EngineReply::text(replies::ASK_EMAIL)
                } else {
                    EngineReply::text(replies::CONSENT_NUDGE)
                }
            }
            OnboardingStep::AwaitingEmail => {
                if EMAIL_RE.is_match(trimmed) {
                    session.collected.email = Some(trimmed.to_string());
                    session.step = OnboardingStep::AwaitingName;
                    EngineReply::text(replies::ASK_NAME)
                } else {
                    EngineReply::text(replies::EMAIL_FORMAT)
                }
            }
            OnboardingStep::AwaitingName => {
                if trimmed.is_empty() || trimmed.chars().count() > MAX_NAME_CHARS {
                    EngineReply::text(replies::NAME_FORMAT)
                } else {
                    session.collected.name = Some(trimmed.to_string());
                    let token = Uuid::new_v4().to_string();
                    session.collected.signup_token = Some(token.clone());
                    session.step = OnboardingStep::AwaitingSignupConfirmation;
                    EngineReply::text(replies::signup_link(&self.signup_url(&token)))
                }
            }
            OnboardingStep::AwaitingSignupConfirmation => {
                // Waiting on the account-linked signal; remind the sender.
                match &session.collected.signup_token {
                    Some(token) => EngineReply::text(replies::signup_reminder(
                        &self.signup_url(token),
                    )),
                    None => {
                        warn!("signup confirmation step without a token; restarting");
                        session.step = OnboardingStep::AwaitingName;
                        EngineReply::text(replies::ASK_NAME)
                    }
                }
            }
            OnboardingStep::AwaitingVerificationCode => {
                return self
                    .check_code(&mut session, phone, trimmed, message_sid, now)
                    .await;
            }
            OnboardingStep::Completed | OnboardingStep::Aborted => {
                // Terminal sessions are deleted; a lingering row restarts.
                session.step = OnboardingStep::AwaitingConsent;
                EngineReply::text(replies::WELCOME)
            }
        };

        session.last_processed_sid = Some(message_sid.clone());
        session.last_reply = Some(reply.body.clone());
        self.sessions.save(&session, now).await?;
        Ok(reply)
    }

    /// External signal: the signup flow created (or found) the account for
    /// this phone. Issues a verification code and moves the session to the
    /// code-entry step. The returned reply carries the code and must be
    /// dispatched as a verification send.
    #[tracing::instrument(name = "OnboardingEngine::account_linked", skip_all, fields(phone = %phone, user_id = %user_id))]
    pub async fn account_linked(
        &self,
        phone: &PhoneNumber,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<EngineReply, OnboardingError> {
        let mut session = match self.sessions.find_active(phone, now).await? {
            Some(session) => session,
            // Session expired between signup and linking: start a fresh one
            // directly at the verification step.
            None => {
                self.sessions
                    .create(phone, self.config.session_ttl, now)
                    .await?
            }
        };

        match self
            .identity
            .create_phone_mapping(user_id, phone, true, false, now)
            .await
        {
            Ok(_) => {}
            // Already linked (webhook replay, or a pre-existing unverified
            // mapping): proceed to verification as usual.
            Err(IdentityError::DuplicatePhone) => {
                info!("phone already mapped; continuing to verification");
            }
            Err(e) => return Err(e.into()),
        }

        let code = self
            .identity
            .issue_verification(user_id, phone, self.config.code_ttl, now)
            .await?;

        session.collected.user_id = Some(user_id.as_i64());
        session.step = OnboardingStep::AwaitingVerificationCode;
        session.last_reply = None;
        self.sessions.save(&session, now).await?;

        Ok(EngineReply::text(replies::verification_code(&code)))
    }

    async fn check_code(
        &self,
        session: &mut OnboardingSession,
        phone: &PhoneNumber,
        code: &str,
        message_sid: &CarrierSid,
        now: DateTime<Utc>,
    ) -> Result<EngineReply, OnboardingError> {
        let Some(user_id) = session.collected.user_id.map(UserId) else {
            warn!("verification step without a linked user; restarting session");
            self.sessions.delete(phone).await?;
            return Ok(EngineReply::text(replies::RESTART));
        };

        match self
            .identity
            .check_verification(user_id, phone, code, now)
            .await
        {
            Ok(()) => {
                self.sessions.delete(phone).await?;
                info!(user_id = %user_id, "onboarding completed");
                Ok(EngineReply {
                    body: replies::COMPLETED.to_string(),
                    completed: true,
                })
            }
            Err(VerificationError::WrongCode { remaining }) if remaining > 0 => {
                let reply = EngineReply::text(replies::wrong_code(remaining));
                session.last_processed_sid = Some(message_sid.clone());
                session.last_reply = Some(reply.body.clone());
                self.sessions.save(session, now).await?;
                Ok(reply)
            }
            Err(
                VerificationError::Expired
                | VerificationError::TooManyAttempts
                | VerificationError::WrongCode { .. },
            ) => {
                self.sessions.delete(phone).await?;
                info!("verification failed terminally; session aborted");
                Ok(EngineReply::text(replies::RESTART))
            }
            Err(VerificationError::Store(e)) => Err(e.into()),
        }
    }

    async fn abort_opted_out(
        &self,
        session: &mut OnboardingSession,
        _message_sid: &CarrierSid,
        now: DateTime<Utc>,
    ) -> Result<EngineReply, OnboardingError> {
        self.sessions
            .record_opt_out(&session.phone, self.config.opt_out_ttl, now)
            .await?;
        self.sessions.delete(&session.phone).await?;
        info!(phone = %session.phone, "sender opted out");
        Ok(EngineReply::text(replies::OPTED_OUT))
    }

    fn signup_url(&self, token: &str) -> String {
        let mut url = self.config.signup_url_base.clone();
        url.query_pairs_mut().append_pair("token", token);
        url.to_string()
    }
}

/// Conversation copy, kept in one place.
pub mod replies {
    pub const WELCOME: &str = "Hi! I'm your personal assistant over SMS. I can help with \
        notes, reminders and questions. Reply YES to continue or STOP to opt out.";

    pub const CONSENT_NUDGE: &str =
        "Just checking: reply YES to continue setting up, or STOP to opt out.";

    pub const ASK_EMAIL: &str = "Great! What's your email address?";

    pub const EMAIL_FORMAT: &str =
        "That doesn't look like an email address. Please send it like name@example.com.";

    pub const ASK_NAME: &str = "Thanks! And your full name?";

    pub const NAME_FORMAT: &str = "Please send your full name (up to 100 characters).";

    pub const OPTED_OUT: &str = "You're opted out and won't hear from us again. \
        Text us anytime if you change your mind.";

    pub const COMPLETED: &str = "You're all set! Your phone is now connected to your \
        account. Just text me whenever you need something.";

    pub const RESTART: &str = "That code can't be used anymore. Text anything to start over \
        and we'll send a fresh one.";

    pub fn signup_link(url: &str) -> String {
        format!("Almost there! Finish creating your account here: {url}")
    }

    pub fn signup_reminder(url: &str) -> String {
        format!("Still waiting on your signup. Finish up here and then we'll verify your phone: {url}")
    }

    pub fn verification_code(code: &str) -> String {
        format!("Your verification code is {code}. Reply with the 6-digit code to finish.")
    }

    pub fn wrong_code(remaining: i64) -> String {
        format!("That code didn't match. {remaining} attempts remaining.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use std::time::Duration;
    use url::Url;

    struct Harness {
        _db: Database,
        sessions: OnboardingStore,
        identity: IdentityStore,
        engine: OnboardingEngine,
    }

    async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        let sessions = OnboardingStore::new(&db);
        let identity = IdentityStore::new(&db);
        let config = OnboardingConfig {
            session_ttl: Duration::from_secs(3600),
            code_ttl: Duration::from_secs(600),
            opt_out_ttl: Duration::from_secs(30 * 24 * 3600),
            signup_url_base: Url::parse("https://app.example.com/signup").unwrap(),
        };
        let engine = OnboardingEngine::new(sessions.clone(), identity.clone(), config);
        Harness {
            _db: db,
            sessions,
            identity,
            engine,
        }
    }

    fn phone(raw: &str) -> PhoneNumber {
        raw.parse().unwrap()
    }

    fn sid(s: &str) -> CarrierSid {
        CarrierSid::from(s)
    }

    #[tokio::test]
    async fn test_first_contact_creates_session_and_welcomes() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        let reply = h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        assert_eq!(reply.body, replies::WELCOME);
        assert!(!reply.completed);

        let session = h.sessions.find_active(&p, now).await.unwrap().unwrap();
        assert_eq!(session.step, OnboardingStep::AwaitingConsent);
    }

    #[tokio::test]
    async fn test_full_flow_to_completion() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();

        let reply = h.engine.advance(&p, "YES", &sid("SM2"), now).await.unwrap();
        assert_eq!(reply.body, replies::ASK_EMAIL);

        let reply = h
            .engine
            .advance(&p, "a@b.com", &sid("SM3"), now)
            .await
            .unwrap();
        assert_eq!(reply.body, replies::ASK_NAME);

        let reply = h
            .engine
            .advance(&p, "Alice", &sid("SM4"), now)
            .await
            .unwrap();
        assert!(reply.body.contains("https://app.example.com/signup?token="));

        let session = h.sessions.find_active(&p, now).await.unwrap().unwrap();
        assert_eq!(session.step, OnboardingStep::AwaitingSignupConfirmation);
        assert_eq!(session.collected.email.as_deref(), Some("a@b.com"));
        assert_eq!(session.collected.name.as_deref(), Some("Alice"));
        let token = session.collected.signup_token.clone().unwrap();
        assert!(reply.body.contains(&token));

        // Registration completes out of band; the webhook links the account.
        let user = h.identity.create_user(now).await.unwrap();
        let reply = h.engine.account_linked(&p, user.id, now).await.unwrap();
        let code: String = reply
            .body
            .chars()
            .filter(|c| c.is_ascii_digit())
            .take(6)
            .collect();
        assert_eq!(code.len(), 6);

        let reply = h.engine.advance(&p, &code, &sid("SM5"), now).await.unwrap();
        assert_eq!(reply.body, replies::COMPLETED);
        assert!(reply.completed);

        // Mapping is verified and primary; session is gone.
        let mapping = h.identity.get_mapping_by_phone(&p).await.unwrap().unwrap();
        assert_eq!(mapping.user_id, user.id);
        assert!(mapping.is_verified);
        assert!(mapping.is_primary);
        assert!(h.sessions.find_active(&p, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_records_opt_out_and_aborts() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        let reply = h
            .engine
            .advance(&p, " Stop ", &sid("SM2"), now)
            .await
            .unwrap();
        assert_eq!(reply.body, replies::OPTED_OUT);

        assert!(h.sessions.is_opted_out(&p, now).await.unwrap());
        assert!(h.sessions.find_active(&p, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_email_reprompts() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        h.engine.advance(&p, "yes", &sid("SM2"), now).await.unwrap();

        let reply = h
            .engine
            .advance(&p, "not-an-email", &sid("SM3"), now)
            .await
            .unwrap();
        assert_eq!(reply.body, replies::EMAIL_FORMAT);

        let session = h.sessions.find_active(&p, now).await.unwrap().unwrap();
        assert_eq!(session.step, OnboardingStep::AwaitingEmail);
        assert!(session.collected.email.is_none());
    }

    #[tokio::test]
    async fn test_overlong_name_reprompts() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        h.engine.advance(&p, "yes", &sid("SM2"), now).await.unwrap();
        h.engine
            .advance(&p, "a@b.com", &sid("SM3"), now)
            .await
            .unwrap();

        let long_name = "x".repeat(101);
        let reply = h
            .engine
            .advance(&p, &long_name, &sid("SM4"), now)
            .await
            .unwrap();
        assert_eq!(reply.body, replies::NAME_FORMAT);
    }

    #[tokio::test]
    async fn test_carrier_retry_replays_reply_without_transition() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        let first = h
            .engine
            .advance(&p, "yes", &sid("SM2"), now)
            .await
            .unwrap();

        // Same sid again: same reply, no state change.
        let replay = h
            .engine
            .advance(&p, "yes", &sid("SM2"), now)
            .await
            .unwrap();
        assert_eq!(replay.body, first.body);

        let session = h.sessions.find_active(&p, now).await.unwrap().unwrap();
        assert_eq!(session.step, OnboardingStep::AwaitingEmail);
    }

    #[tokio::test]
    async fn test_expired_session_restarts_at_welcome() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        h.engine.advance(&p, "yes", &sid("SM2"), now).await.unwrap();

        let after_ttl = now + chrono::Duration::seconds(3601);
        let reply = h
            .engine
            .advance(&p, "a@b.com", &sid("SM3"), after_ttl)
            .await
            .unwrap();
        // The email lands on a fresh session, which welcomes first.
        assert_eq!(reply.body, replies::WELCOME);
    }

    #[tokio::test]
    async fn test_wrong_code_counts_down_then_aborts() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        h.engine.advance(&p, "yes", &sid("SM2"), now).await.unwrap();
        h.engine
            .advance(&p, "a@b.com", &sid("SM3"), now)
            .await
            .unwrap();
        h.engine
            .advance(&p, "Alice", &sid("SM4"), now)
            .await
            .unwrap();
        let user = h.identity.create_user(now).await.unwrap();
        let linked = h.engine.account_linked(&p, user.id, now).await.unwrap();
        let real: String = linked
            .body
            .chars()
            .filter(|c| c.is_ascii_digit())
            .take(6)
            .collect();
        let wrong = if real == "000000" { "000001" } else { "000000" };

        let mut n = 5;
        for i in 0..4 {
            let reply = h
                .engine
                .advance(&p, wrong, &sid(&format!("SMw{i}")), now)
                .await
                .unwrap();
            n -= 1;
            assert_eq!(reply.body, replies::wrong_code(n));
        }

        // Fifth failure exhausts the budget; the session aborts.
        let reply = h
            .engine
            .advance(&p, wrong, &sid("SMw5"), now)
            .await
            .unwrap();
        assert_eq!(reply.body, replies::RESTART);
        assert!(h.sessions.find_active(&p, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_code_aborts() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        h.engine.advance(&p, "yes", &sid("SM2"), now).await.unwrap();
        h.engine
            .advance(&p, "a@b.com", &sid("SM3"), now)
            .await
            .unwrap();
        h.engine
            .advance(&p, "Alice", &sid("SM4"), now)
            .await
            .unwrap();
        let user = h.identity.create_user(now).await.unwrap();
        let linked = h.engine.account_linked(&p, user.id, now).await.unwrap();
        let code: String = linked
            .body
            .chars()
            .filter(|c| c.is_ascii_digit())
            .take(6)
            .collect();

        let after_code_ttl = now + chrono::Duration::seconds(601);
        let reply = h
            .engine
            .advance(&p, &code, &sid("SM5"), after_code_ttl)
            .await
            .unwrap();
        assert_eq!(reply.body, replies::RESTART);
        assert!(
            h.sessions
                .find_active(&p, after_code_ttl)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_account_linked_twice_is_idempotent() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        h.engine.advance(&p, "yes", &sid("SM2"), now).await.unwrap();
        h.engine
            .advance(&p, "a@b.com", &sid("SM3"), now)
            .await
            .unwrap();
        h.engine
            .advance(&p, "Alice", &sid("SM4"), now)
            .await
            .unwrap();

        let user = h.identity.create_user(now).await.unwrap();
        h.engine.account_linked(&p, user.id, now).await.unwrap();
        // Webhook replay: mapping already exists, a fresh code is issued.
        let second = h.engine.account_linked(&p, user.id, now).await.unwrap();
        let code: String = second
            .body
            .chars()
            .filter(|c| c.is_ascii_digit())
            .take(6)
            .collect();

        let reply = h.engine.advance(&p, &code, &sid("SM5"), now).await.unwrap();
        assert!(reply.completed);
    }

    #[tokio::test]
    async fn test_unrecognized_consent_input_nudges() {
        let h = harness().await;
        let p = phone("+15551234567");
        let now = Utc::now();

        h.engine.advance(&p, "hi", &sid("SM1"), now).await.unwrap();
        let reply = h
            .engine
            .advance(&p, "maybe later", &sid("SM2"), now)
            .await
            .unwrap();
        assert_eq!(reply.body, replies::CONSENT_NUDGE);

        let session = h.sessions.find_active(&p, now).await.unwrap().unwrap();
        assert_eq!(session.step, OnboardingStep::AwaitingConsent);
    }
}
