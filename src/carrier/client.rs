//! Carrier REST client.

use super::signature;
use super::types::{ApiErrorBody, ErrorCodeTable, SendReceipt};
use crate::config::CarrierConfig;
use crate::errors::{ClassifyError, ErrorClass};
use crate::phone::PhoneNumber;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

/// Error talking to the carrier.
#[derive(Debug, Error)]
pub enum CarrierError {
    /// Failed to construct the underlying HTTP client.
    #[error("failed to build HTTP client: {0}")]
    BuildHttpClient(#[source] reqwest::Error),

    /// The configured base URL cannot be extended with the API path.
    #[error("invalid carrier endpoint: {0}")]
    InvalidEndpoint(String),

    /// Request-level failure (connect, TLS, middleware).
    #[error("carrier HTTP request failed: {0}")]
    Http(#[source] reqwest_middleware::Error),

    /// The request hit the per-request deadline.
    #[error("carrier request timed out")]
    Timeout,

    /// The carrier answered with a non-success status.
    #[error("carrier API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The carrier answered 2xx but the body was not understood.
    #[error("failed to parse carrier response: {0}")]
    ParseResponse(#[source] reqwest::Error),
}

impl CarrierError {
    fn classify_with(&self, codes: &ErrorCodeTable) -> ErrorClass {
        match self {
            Self::Http(_) | Self::Timeout | Self::ParseResponse(_) => ErrorClass::Transient,
            Self::Api { status, code, .. } => {
                if *status >= 500 || *status == 429 {
                    ErrorClass::Transient
                } else {
                    codes.classify(code.as_deref())
                }
            }
            Self::BuildHttpClient(_) | Self::InvalidEndpoint(_) => ErrorClass::Permanent,
        }
    }
}

impl ClassifyError for CarrierError {
    fn class(&self) -> ErrorClass {
        self.classify_with(&ErrorCodeTable::default())
    }
}

/// Thin capability over the SMS carrier: send, validate webhook signatures,
/// classify provider error codes.
///
/// # Example
///
/// ```rust,ignore
/// use sms_gateway::carrier::CarrierClient;
///
/// let client = CarrierClient::new(&config.carrier)?;
/// let receipt = client.send(&to, "hello").await?;
/// println!("queued as {}", receipt.sid);
/// ```
#[derive(Clone)]
pub struct CarrierClient {
    http: ClientWithMiddleware,
    account_sid: String,
    auth_token: SecretString,
    from_number: PhoneNumber,
    messages_endpoint: Url,
    status_callback: Option<Url>,
    codes: ErrorCodeTable,
}

impl std::fmt::Debug for CarrierClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarrierClient")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("from_number", &self.from_number)
            .field("messages_endpoint", &self.messages_endpoint)
            .finish()
    }
}

/// Builder for configuring a [`CarrierClient`].
pub struct CarrierClientBuilder {
    config: CarrierConfig,
    http: Option<ClientWithMiddleware>,
    codes: ErrorCodeTable,
}

impl CarrierClientBuilder {
    pub fn new(config: CarrierConfig) -> Self {
        Self {
            config,
            http: None,
            codes: ErrorCodeTable::default(),
        }
    }

    /// Use a custom HTTP client (tests inject one pointed at a mock server).
    pub fn http_client(mut self, client: ClientWithMiddleware) -> Self {
        self.http = Some(client);
        self
    }

    /// Replace the error-code classification table.
    pub fn error_codes(mut self, codes: ErrorCodeTable) -> Self {
        self.codes = codes;
        self
    }

    pub fn build(self) -> Result<CarrierClient, CarrierError> {
        let http = match self.http {
            Some(client) => client,
            None => {
                let client = reqwest::Client::builder()
                    .timeout(self.config.request_timeout)
                    .build()
                    .map_err(CarrierError::BuildHttpClient)?;
                ClientBuilder::new(client).build()
            }
        };

        let messages_endpoint = self
            .config
            .base_url
            .join("Messages")
            .map_err(|e| CarrierError::InvalidEndpoint(e.to_string()))?;

        Ok(CarrierClient {
            http,
            account_sid: self.config.account_sid,
            auth_token: self.config.auth_token,
            from_number: self.config.from_number,
            messages_endpoint,
            status_callback: self.config.status_callback_url,
            codes: self.codes,
        })
    }
}

impl CarrierClient {
    /// Build a client from carrier configuration.
    pub fn new(config: &CarrierConfig) -> Result<Self, CarrierError> {
        Self::builder(config.clone()).build()
    }

    pub fn builder(config: CarrierConfig) -> CarrierClientBuilder {
        CarrierClientBuilder::new(config)
    }

    /// The carrier number outbound messages are sent from.
    pub fn from_number(&self) -> &PhoneNumber {
        &self.from_number
    }

    /// Send one SMS. Returns the carrier sid for status correlation.
    #[tracing::instrument(name = "CarrierClient::send", skip_all, fields(to = %to))]
    pub async fn send(&self, to: &PhoneNumber, body: &str) -> Result<SendReceipt, CarrierError> {
        let mut form: Vec<(&str, String)> = vec![
            ("From", self.from_number.as_str().to_string()),
            ("To", to.as_str().to_string()),
            ("Body", body.to_string()),
        ];
        if let Some(callback) = &self.status_callback {
            form.push(("StatusCallback", callback.to_string()));
        }

        let response = self
            .http
            .post(self.messages_endpoint.clone())
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&form)
            .send()
            .await
            .map_err(|e| match &e {
                reqwest_middleware::Error::Reqwest(inner) if inner.is_timeout() => {
                    CarrierError::Timeout
                }
                _ => CarrierError::Http(e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: ApiErrorBody = response.json().await.unwrap_or(ApiErrorBody {
                code: None,
                message: None,
            });
            return Err(CarrierError::Api {
                status: status.as_u16(),
                code: body.code.map(|c| c.to_string()),
                message: body
                    .message
                    .unwrap_or_else(|| "carrier returned an error".to_string()),
            });
        }

        let receipt: SendReceipt = response.json().await.map_err(CarrierError::ParseResponse)?;
        tracing::debug!(sid = %receipt.sid, status = ?receipt.status, "carrier accepted send");
        Ok(receipt)
    }

    /// Validate a webhook signature against the exact raw body and the full
    /// request URL (including query string).
    pub fn validate_signature(&self, url: &str, raw_body: &[u8], provided: &str) -> bool {
        signature::verify(self.auth_token.expose_secret(), url, raw_body, provided)
    }

    /// Classify a carrier error code for the retry scheduler.
    pub fn classify(&self, error_code: Option<&str>) -> ErrorClass {
        self.codes.classify(error_code)
    }

    /// Classify a send failure, consulting the configured code table.
    pub fn classify_send_error(&self, err: &CarrierError) -> ErrorClass {
        err.classify_with(&self.codes)
    }
}
