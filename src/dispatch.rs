//! Outbound delivery: policy-checked sends, status reconciliation,
//! scheduled retries and usage accounting.

use crate::carrier::{CarrierClient, CarrierError, DeliveryStatus};
use crate::config::{CostTable, RetryPolicy};
use crate::phone::PhoneNumber;
use crate::store::StoreError;
use crate::store::onboarding::OnboardingStore;
use crate::store::usage::{NewAttempt, SmsAttempt, UsageStore};
use crate::sync::KeyedMutex;
use crate::types::{AttemptId, CarrierSid, Direction, FinalStatus, SendKind, UserId, YearMonth};
use chrono::{DateTime, Utc};
use isocountry::CountryCode;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Carrier-imposed ceiling on one logical message body.
pub const MAX_BODY_CHARS: usize = 1600;

/// Attempts stuck non-terminal longer than this are reaped as failed.
const STALE_AFTER: Duration = Duration::from_secs(24 * 3600);

/// An accepted send with no status movement for this long counts as a
/// transient failure and re-enters the retry schedule.
const STUCK_AFTER: Duration = Duration::from_secs(5 * 60);

/// Maximum deviation applied to the retry schedule, in percent.
const JITTER_DELTA: f64 = 0.2;

/// How many due retries one tick will process.
const RETRY_BATCH: i64 = 100;

/// Error returned by [`OutboundDispatcher::send`].
///
/// Carrier-level failures are *not* surfaced here: once the attempt row
/// exists its lifecycle (retries, terminal status) is the dispatcher's
/// problem, and the caller still gets the attempt id.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message body is {length} characters, limit is {}", MAX_BODY_CHARS)]
    BodyTooLong { length: usize },

    #[error("monthly outbound budget exhausted for user {0}")]
    BudgetExceeded(UserId),

    #[error("recipient has opted out")]
    OptedOut,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Send-with-retry, status reconciliation and usage accounting.
pub struct OutboundDispatcher {
    carrier: CarrierClient,
    usage: UsageStore,
    onboarding: OnboardingStore,
    retry: RetryPolicy,
    cost: CostTable,
    monthly_limit: Option<i64>,
}

impl OutboundDispatcher {
    pub fn new(
        carrier: CarrierClient,
        usage: UsageStore,
        onboarding: OnboardingStore,
        retry: RetryPolicy,
        cost: CostTable,
        monthly_limit: Option<i64>,
    ) -> Self {
        Self {
            carrier,
            usage,
            onboarding,
            retry,
            cost,
            monthly_limit,
        }
    }

    /// Send one SMS as a single logical attempt.
    ///
    /// Policy rejections (body length, budget, opt-out) happen before any
    /// attempt row exists. After that the attempt is always created; a
    /// failing carrier call only shapes its retry schedule.
    #[tracing::instrument(name = "OutboundDispatcher::send", skip_all, fields(to = %to, kind = ?kind))]
    pub async fn send(
        &self,
        user_id: Option<UserId>,
        to: &PhoneNumber,
        body: &str,
        kind: SendKind,
        now: DateTime<Utc>,
    ) -> Result<AttemptId, SendError> {
        let length = body.chars().count();
        if length > MAX_BODY_CHARS {
            return Err(SendError::BodyTooLong { length });
        }

        if !kind.bypasses_opt_out() && self.onboarding.is_opted_out(to, now).await? {
            return Err(SendError::OptedOut);
        }

        if let (Some(uid), Some(limit)) = (user_id, self.monthly_limit) {
            let period = YearMonth::of(now);
            let used = self
                .usage
                .get_usage(uid, &period)
                .await?
                .map(|c| c.sms_count_out)
                .unwrap_or(0);
            if used >= limit {
                return Err(SendError::BudgetExceeded(uid));
            }
        }

        let country = destination_country(to);
        let attempt_id = self
            .usage
            .insert_attempt(
                &NewAttempt {
                    user_id,
                    phone: to.clone(),
                    direction: Direction::Out,
                    body: body.to_string(),
                    carrier_sid: None,
                    final_status: FinalStatus::Unknown,
                    max_retries: i64::from(self.retry.max_retries),
                    country_code: country.alpha2().to_string(),
                },
                now,
            )
            .await?;

        match self.carrier.send(to, body).await {
            Ok(receipt) => {
                self.accept(attempt_id, &receipt.sid, receipt.status, now)
                    .await?;
            }
            Err(err) => {
                self.handle_send_failure(attempt_id, 0, &err, now).await?;
            }
        }

        Ok(attempt_id)
    }

    /// Record the inbound half of an exchange: one attempt row (inbound is
    /// by definition delivered to us) plus the per-user inbound counter.
    pub async fn record_inbound(
        &self,
        user_id: Option<UserId>,
        from: &PhoneNumber,
        body: &str,
        message_sid: &CarrierSid,
        now: DateTime<Utc>,
    ) -> Result<AttemptId, StoreError> {
        let country = destination_country(from);
        let attempt_id = self
            .usage
            .insert_attempt(
                &NewAttempt {
                    user_id,
                    phone: from.clone(),
                    direction: Direction::In,
                    body: body.to_string(),
                    carrier_sid: Some(message_sid.clone()),
                    final_status: FinalStatus::Delivered,
                    max_retries: 0,
                    country_code: country.alpha2().to_string(),
                },
                now,
            )
            .await?;

        if let Some(uid) = user_id {
            self.usage
                .add_usage(uid, &YearMonth::of(now), 1, 0, 0)
                .await?;
        }

        Ok(attempt_id)
    }

    /// Reconcile one carrier status callback.
    ///
    /// Terminal attempts are write-once: late or duplicate callbacks are
    /// ignored, which also makes the delivered-usage increment idempotent.
    #[tracing::instrument(name = "OutboundDispatcher::on_status_callback", skip_all, fields(sid = %sid, status = %provider_status))]
    pub async fn on_status_callback(
        &self,
        sid: &CarrierSid,
        provider_status: &str,
        error_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(attempt) = self.usage.find_by_sid(sid).await? else {
            warn!(sid = %sid, "status callback for unknown attempt");
            return Ok(());
        };

        if attempt.final_status.is_terminal() {
            debug!(attempt_id = %attempt.id, "ignoring callback after terminal status");
            return Ok(());
        }

        let Some(status) = DeliveryStatus::parse(provider_status) else {
            warn!(attempt_id = %attempt.id, status = provider_status, "unrecognized provider status");
            return Ok(());
        };

        match status {
            DeliveryStatus::Accepted
            | DeliveryStatus::Queued
            | DeliveryStatus::Sending
            | DeliveryStatus::Receiving
            | DeliveryStatus::Received => {
                self.usage
                    .update_provider_status(
                        attempt.id,
                        status.as_str(),
                        attempt.final_status,
                        now,
                    )
                    .await?;
            }
            DeliveryStatus::Sent => {
                self.usage
                    .update_provider_status(attempt.id, status.as_str(), FinalStatus::Sent, now)
                    .await?;
            }
            DeliveryStatus::Delivered => {
                let cost = self.cost_of(&attempt);
                self.usage
                    .finalize(
                        attempt.id,
                        FinalStatus::Delivered,
                        Some(status.as_str()),
                        None,
                        None,
                        Some(cost),
                        now,
                    )
                    .await?;
                if let Some(uid) = attempt.user_id {
                    self.usage
                        .add_usage(uid, &YearMonth::of(now), 0, 1, cost)
                        .await?;
                }
                info!(attempt_id = %attempt.id, cost_cents = cost, "delivered");
            }
            DeliveryStatus::Failed | DeliveryStatus::Undelivered => {
                let terminal = if status == DeliveryStatus::Undelivered {
                    FinalStatus::Undelivered
                } else {
                    FinalStatus::Failed
                };
                if self.carrier.classify(error_code).is_transient()
                    && attempt.retry_count < attempt.max_retries
                {
                    self.schedule_next_retry(&attempt, error_code, None, now)
                        .await?;
                } else {
                    self.usage
                        .finalize(
                            attempt.id,
                            terminal,
                            Some(status.as_str()),
                            error_code,
                            None,
                            None,
                            now,
                        )
                        .await?;
                    info!(attempt_id = %attempt.id, status = %terminal, error_code, "attempt finalized");
                }
            }
        }

        Ok(())
    }

    /// Resend every attempt whose scheduled retry is due. Returns how many
    /// were processed.
    #[tracing::instrument(name = "OutboundDispatcher::tick_retries", skip_all)]
    pub async fn tick_retries(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self.usage.due_retries(now, RETRY_BATCH).await?;
        let count = due.len();

        for attempt in due {
            debug!(attempt_id = %attempt.id, retry = attempt.retry_count, "resending");
            match self.carrier.send(&attempt.phone, &attempt.body).await {
                Ok(receipt) => {
                    self.accept(attempt.id, &receipt.sid, receipt.status, now)
                        .await?;
                }
                Err(err) => {
                    self.handle_send_failure(attempt.id, attempt.retry_count, &err, now)
                        .await?;
                }
            }
        }

        // Accepted sends the carrier went silent on: treat as transient.
        let stuck_cutoff = now - chrono::Duration::from_std(STUCK_AFTER).unwrap_or_default();
        for attempt in self.usage.stuck_attempts(stuck_cutoff, RETRY_BATCH).await? {
            if attempt.retry_count < attempt.max_retries {
                warn!(attempt_id = %attempt.id, "no status movement; scheduling retry");
                self.schedule_next_retry(&attempt, None, Some("stuck without terminal status"), now)
                    .await?;
            } else {
                self.usage
                    .finalize(
                        attempt.id,
                        FinalStatus::Failed,
                        None,
                        None,
                        Some("stuck without terminal status"),
                        None,
                        now,
                    )
                    .await?;
            }
        }

        Ok(count)
    }

    /// Close out attempts that never reached a terminal status (carrier
    /// callbacks lost, process crashes mid-flight).
    pub async fn reconcile_stale(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now - chrono::Duration::from_std(STALE_AFTER).unwrap_or_default();
        let reaped = self.usage.reap_stale(cutoff, now).await?;
        if reaped > 0 {
            warn!(reaped, "reconciled stale attempts as failed");
        }
        Ok(reaped)
    }

    async fn accept(
        &self,
        id: AttemptId,
        sid: &CarrierSid,
        status: Option<DeliveryStatus>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let final_status = match status {
            Some(DeliveryStatus::Sent) => FinalStatus::Sent,
            _ => FinalStatus::Unknown,
        };
        self.usage
            .record_carrier_accept(
                id,
                sid,
                status.map(DeliveryStatus::as_str),
                final_status,
                now,
            )
            .await
    }

    /// Shared failure path for first sends and resends. `retry_count` is the
    /// number of retries already consumed before this failure.
    async fn handle_send_failure(
        &self,
        id: AttemptId,
        retry_count: i64,
        err: &CarrierError,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let code = match err {
            CarrierError::Api { code, .. } => code.clone(),
            _ => None,
        };
        let transient = self.carrier.classify_send_error(err).is_transient();

        if transient && retry_count < i64::from(self.retry.max_retries) {
            if let Some(attempt) = self.usage.get(id).await? {
                self.schedule_next_retry(&attempt, code.as_deref(), Some(&err.to_string()), now)
                    .await?;
            }
        } else {
            warn!(attempt_id = %id, error = %err, "send failed terminally");
            self.usage
                .finalize(
                    id,
                    FinalStatus::Failed,
                    None,
                    code.as_deref(),
                    Some(&err.to_string()),
                    None,
                    now,
                )
                .await?;
        }
        Ok(())
    }

    async fn schedule_next_retry(
        &self,
        attempt: &SmsAttempt,
        error_code: Option<&str>,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let next_count = attempt.retry_count + 1;
        let jitter = rand::thread_rng().gen_range(-JITTER_DELTA..=JITTER_DELTA);
        let delay = self.retry.delay(next_count.min(i64::from(u32::MAX)) as u32, jitter);
        let next_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

        info!(
            attempt_id = %attempt.id,
            retry = next_count,
            delay_secs = delay.as_secs(),
            error_code,
            "scheduling retry"
        );
        self.usage
            .schedule_retry(attempt.id, next_count, next_at, error_code, error_message, now)
            .await
    }

    fn cost_of(&self, attempt: &SmsAttempt) -> i64 {
        let country = CountryCode::for_alpha2(&attempt.country_code)
            .unwrap_or(CountryCode::USA);
        self.cost.cents_for(country)
    }
}

/// Advisory destination country for pricing, re-derived from the canonical
/// number (cannot fail for values produced by normalization).
fn destination_country(phone: &PhoneNumber) -> CountryCode {
    PhoneNumber::normalize(phone.as_str())
        .map(|n| n.country)
        .unwrap_or(CountryCode::USA)
}

/// Background loop driving retries, the stale reconciler, onboarding-session
/// harvesting and keyed-lock sweeping until cancelled.
pub async fn run_ticker(
    dispatcher: Arc<OutboundDispatcher>,
    locks: Arc<KeyedMutex>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("dispatch ticker stopping");
                break;
            }
            _ = interval.tick() => {
                let now = Utc::now();
                if let Err(e) = dispatcher.tick_retries(now).await {
                    warn!(error = %e, "retry tick failed");
                }
                if let Err(e) = dispatcher.reconcile_stale(now).await {
                    warn!(error = %e, "stale reconciliation failed");
                }
                if let Err(e) = dispatcher.onboarding.purge_expired(now).await {
                    warn!(error = %e, "session purge failed");
                }
                locks.sweep();
            }
        }
    }
}
