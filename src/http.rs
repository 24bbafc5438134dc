//! HTTP adapters for the carrier webhooks.
//!
//! The handlers stay thin: verify the signature against the raw body,
//! parse once into the typed payloads, call the router/dispatcher, and
//! translate outcomes into the carrier's expected status codes (403 bad
//! signature, 400 malformed body, otherwise 200 with an empty body so the
//! carrier never retries on our internal errors).

use crate::carrier::{CarrierClient, InboundWebhook, StatusWebhook};
use crate::dispatch::OutboundDispatcher;
use crate::router::InboundRouter;
use crate::types::UserId;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};
use url::Url;

/// Header carrying the carrier's webhook signature.
pub const SIGNATURE_HEADER: &str = "X-Carrier-Signature";

/// Shared state for the webhook surface.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<InboundRouter>,
    pub dispatcher: Arc<OutboundDispatcher>,
    pub carrier: CarrierClient,
    /// Base the carrier signed against (scheme + authority).
    pub public_base_url: Url,
}

/// Assemble the webhook application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sms/inbound", post(inbound_webhook))
        .route("/sms/status", post(status_webhook))
        .route("/onboarding/linked", post(account_linked_hook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Full request URL as the carrier signed it.
fn signed_url(state: &AppState, uri: &axum::http::Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!(
        "{}{}",
        state.public_base_url.as_str().trim_end_matches('/'),
        path_and_query
    )
}

fn verify(state: &AppState, uri: &axum::http::Uri, headers: &HeaderMap, body: &[u8]) -> bool {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    state
        .carrier
        .validate_signature(&signed_url(state, uri), body, provided)
}

async fn inbound_webhook(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !verify(&state, &uri, &headers, &body) {
        warn!("inbound webhook rejected: bad signature");
        return StatusCode::FORBIDDEN;
    }

    let payload: InboundWebhook = match serde_urlencoded::from_bytes(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "inbound webhook rejected: malformed body");
            return StatusCode::BAD_REQUEST;
        }
    };

    // Internal failures still answer 200-empty: a carrier retry would only
    // amplify the load, and the reconciler cleans up half-done attempts.
    if let Err(e) = state.router.handle_inbound(&payload, Utc::now()).await {
        error!(error = %e, sid = %payload.message_sid, "inbound processing failed");
    }
    StatusCode::OK
}

async fn status_webhook(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !verify(&state, &uri, &headers, &body) {
        warn!("status webhook rejected: bad signature");
        return StatusCode::FORBIDDEN;
    }

    let payload: StatusWebhook = match serde_urlencoded::from_bytes(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "status webhook rejected: malformed body");
            return StatusCode::BAD_REQUEST;
        }
    };

    if let Err(e) = state
        .dispatcher
        .on_status_callback(
            &payload.message_sid,
            &payload.message_status,
            payload.error_code.as_deref(),
            Utc::now(),
        )
        .await
    {
        error!(error = %e, sid = %payload.message_sid, "status processing failed");
    }
    StatusCode::OK
}

/// Internal hook from the registration flow: an account now exists for a
/// phone that is mid-onboarding.
#[derive(Debug, Deserialize)]
pub struct AccountLinkedRequest {
    pub phone: String,
    pub user_id: i64,
}

async fn account_linked_hook(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<AccountLinkedRequest>,
) -> impl IntoResponse {
    match state
        .router
        .handle_account_linked(&request.phone, UserId(request.user_id), Utc::now())
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(error = %e, user_id = request.user_id, "account-linked hook failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
