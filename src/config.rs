//! Gateway configuration, sourced from environment variables.
//!
//! `main` loads `.env` via dotenvy and calls [`GatewayConfig::from_env`];
//! the library never reads the environment anywhere else.

use crate::phone::PhoneNumber;
use isocountry::CountryCode;
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Error building configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Carrier account credentials and egress endpoints.
#[derive(Debug, Clone)]
pub struct CarrierConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// The single carrier number all traffic flows through.
    pub from_number: PhoneNumber,
    /// Base URL for the carrier REST API.
    pub base_url: Url,
    /// Where the carrier should POST status callbacks for our sends.
    pub status_callback_url: Option<Url>,
    /// Per-request timeout for carrier HTTP calls.
    pub request_timeout: Duration,
}

/// Scheduled-retry policy for outbound sends.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(1800),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the n-th retry (n starts at 1): `base * 2^(n-1)`,
    /// scaled by a jitter factor and capped.
    ///
    /// The caller supplies `jitter` in `[-0.2, 0.2]` so the schedule itself
    /// stays deterministic under test.
    pub fn delay(&self, n: u32, jitter: f64) -> Duration {
        let exp = n.saturating_sub(1).min(20);
        let raw = self.base.as_secs_f64() * f64::from(2u32.saturating_pow(exp).min(1 << 20));
        let jittered = raw * (1.0 + jitter);
        Duration::from_secs_f64(jittered.min(self.cap.as_secs_f64()).max(0.0))
    }
}

/// Onboarding conversation settings.
#[derive(Debug, Clone)]
pub struct OnboardingConfig {
    /// Session TTL (spec: at most 1 hour).
    pub session_ttl: Duration,
    /// Verification code TTL.
    pub code_ttl: Duration,
    /// How long an opt-out blocks outbound traffic.
    pub opt_out_ttl: Duration,
    /// Base URL the signup token is appended to.
    pub signup_url_base: Url,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(3600),
            code_ttl: Duration::from_secs(600),
            opt_out_ttl: Duration::from_secs(30 * 24 * 3600),
            signup_url_base: Url::parse("https://example.invalid/signup")
                .expect("static URL"),
        }
    }
}

/// Phone-resolver cache TTLs.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
        }
    }
}

/// Country → cost-cents pricing table (configuration artifact).
#[derive(Debug, Clone)]
pub struct CostTable {
    per_country: HashMap<String, i64>,
    default_cents: i64,
}

impl Default for CostTable {
    fn default() -> Self {
        let mut per_country = HashMap::new();
        for (cc, cents) in [("US", 1), ("CA", 1), ("GB", 2), ("DE", 2), ("FR", 2)] {
            per_country.insert(cc.to_string(), cents);
        }
        Self {
            per_country,
            default_cents: 2,
        }
    }
}

impl CostTable {
    /// Price one outbound segment-set for a destination country, in cents.
    pub fn cents_for(&self, country: CountryCode) -> i64 {
        self.per_country
            .get(country.alpha2())
            .copied()
            .unwrap_or(self.default_cents)
    }

    /// Parse `"US=1,GB=2"`-style overrides on top of the defaults.
    pub fn with_overrides(mut self, spec: &str) -> Result<Self, ConfigError> {
        for pair in spec.split(',').filter(|p| !p.trim().is_empty()) {
            let (cc, cents) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Invalid {
                    var: "SMS_COST_TABLE",
                    reason: format!("expected CC=cents, got '{pair}'"),
                })?;
            let cents: i64 = cents.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "SMS_COST_TABLE",
                reason: format!("'{cents}' is not an integer"),
            })?;
            self.per_country.insert(cc.trim().to_uppercase(), cents);
        }
        Ok(self)
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub carrier: CarrierConfig,
    pub retry: RetryPolicy,
    pub onboarding: OnboardingConfig,
    pub resolver: ResolverConfig,
    /// Hard deadline for one agent-runtime call.
    pub agent_deadline: Duration,
    /// Optional per-user monthly outbound budget.
    pub monthly_limit: Option<i64>,
    pub cost: CostTable,
    pub database_url: String,
    pub listen_addr: SocketAddr,
    /// Public base URL webhooks are signed against.
    pub public_base_url: Url,
}

impl GatewayConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let carrier = CarrierConfig {
            account_sid: required("CARRIER_ACCOUNT_SID")?,
            auth_token: SecretString::from(required("CARRIER_AUTH_TOKEN")?),
            from_number: required("CARRIER_FROM_NUMBER")?
                .parse()
                .map_err(|e| invalid("CARRIER_FROM_NUMBER", e))?,
            base_url: parse_url(
                "CARRIER_BASE_URL",
                optional("CARRIER_BASE_URL")
                    .unwrap_or_else(|| "https://api.carrier.example/2010-04-01".to_string()),
            )?,
            status_callback_url: optional("CARRIER_STATUS_CALLBACK_URL")
                .map(|v| parse_url("CARRIER_STATUS_CALLBACK_URL", v))
                .transpose()?,
            request_timeout: duration_secs("CARRIER_REQUEST_TIMEOUT_SECONDS", 10)?,
        };

        let retry = RetryPolicy {
            max_retries: int("SMS_MAX_RETRIES", 3)? as u32,
            base: duration_secs("SMS_RETRY_BASE_SECONDS", 30)?,
            cap: duration_secs("SMS_RETRY_MAX_SECONDS", 1800)?,
        };

        let onboarding = OnboardingConfig {
            session_ttl: duration_secs("ONBOARDING_SESSION_TTL_SECONDS", 3600)?,
            code_ttl: duration_secs("VERIFICATION_CODE_TTL_SECONDS", 600)?,
            opt_out_ttl: duration_secs("ONBOARDING_OPT_OUT_TTL_SECONDS", 30 * 24 * 3600)?,
            signup_url_base: parse_url(
                "SIGNUP_URL_BASE",
                optional("SIGNUP_URL_BASE")
                    .unwrap_or_else(|| "https://example.invalid/signup".to_string()),
            )?,
        };

        let resolver = ResolverConfig {
            ttl: duration_secs("PHONE_RESOLVER_TTL_SECONDS", 300)?,
            negative_ttl: duration_secs("PHONE_RESOLVER_NEG_TTL_SECONDS", 30)?,
        };

        let cost = match optional("SMS_COST_TABLE") {
            Some(spec) => CostTable::default().with_overrides(&spec)?,
            None => CostTable::default(),
        };

        Ok(Self {
            carrier,
            retry,
            onboarding,
            resolver,
            agent_deadline: duration_secs("AGENT_CALL_DEADLINE_SECONDS", 25)?,
            monthly_limit: optional("SMS_MONTHLY_LIMIT")
                .map(|v| {
                    v.parse::<i64>().map_err(|_| ConfigError::Invalid {
                        var: "SMS_MONTHLY_LIMIT",
                        reason: format!("'{v}' is not an integer"),
                    })
                })
                .transpose()?,
            cost,
            database_url: required("DATABASE_URL")?,
            listen_addr: optional("LISTEN_ADDR")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string())
                .parse()
                .map_err(|e| invalid("LISTEN_ADDR", e))?,
            public_base_url: parse_url(
                "PUBLIC_BASE_URL",
                optional("PUBLIC_BASE_URL")
                    .unwrap_or_else(|| "http://localhost:8080".to_string()),
            )?,
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn invalid(var: &'static str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: err.to_string(),
    }
}

fn parse_url(var: &'static str, value: String) -> Result<Url, ConfigError> {
    Url::parse(&value).map_err(|e| invalid(var, e))
}

fn int(var: &'static str, default: i64) -> Result<i64, ConfigError> {
    match optional(var) {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            var,
            reason: format!("'{v}' is not an integer"),
        }),
        None => Ok(default),
    }
}

fn duration_secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(int(var, default as i64)? as u64))
}
