//! Shared harness for the integration suites: a fully wired gateway with a
//! mocked carrier and an in-memory database, driven through the webhook
//! surface exactly as the carrier would.

// Each suite pulls a different subset of the helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use secrecy::SecretString;
use sms_gateway::agent::{AgentError, AgentRuntime};
use sms_gateway::carrier::{CarrierClient, signature};
use sms_gateway::config::{
    CarrierConfig, CostTable, OnboardingConfig, ResolverConfig, RetryPolicy,
};
use sms_gateway::dispatch::OutboundDispatcher;
use sms_gateway::http::{AppState, SIGNATURE_HEADER, app};
use sms_gateway::onboarding::OnboardingEngine;
use sms_gateway::resolver::PhoneResolver;
use sms_gateway::router::InboundRouter;
use sms_gateway::store::Database;
use sms_gateway::store::identity::IdentityStore;
use sms_gateway::store::onboarding::OnboardingStore;
use sms_gateway::store::usage::UsageStore;
use sms_gateway::sync::KeyedMutex;
use sms_gateway::types::UserId;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const AUTH_TOKEN: &str = "test_webhook_secret";
pub const PUBLIC_BASE: &str = "https://gw.example.com";

pub struct EchoAgent;

#[async_trait]
impl AgentRuntime for EchoAgent {
    async fn handle(&self, _user_id: UserId, text: &str) -> Result<String, AgentError> {
        Ok(format!("echo: {text}"))
    }
}

pub struct TestGateway {
    pub app: Router,
    pub db: Database,
    pub identity: IdentityStore,
    pub usage: UsageStore,
    pub sessions: OnboardingStore,
    pub dispatcher: Arc<OutboundDispatcher>,
    pub carrier_mock: MockServer,
}

/// Gateway with the echo agent, no budget, and a carrier that accepts every
/// send as `SMout-<n>` (unique sid per call).
pub async fn gateway() -> TestGateway {
    gateway_with(Arc::new(EchoAgent), None).await
}

pub async fn gateway_with(
    agent: Arc<dyn AgentRuntime>,
    monthly_limit: Option<i64>,
) -> TestGateway {
    let db = Database::in_memory().await.unwrap();
    let identity = IdentityStore::new(&db);
    let usage = UsageStore::new(&db);
    let sessions = OnboardingStore::new(&db);
    let carrier_mock = MockServer::start().await;

    // Each accepted send gets a distinct sid so outbound attempts never
    // collide on the unique sid index.
    for n in 0..32 {
        Mock::given(method("POST"))
            .and(path("/Messages"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sid": format!("SMout-{n}"),
                "status": "queued"
            })))
            .up_to_n_times(1)
            .mount(&carrier_mock)
            .await;
    }

    let carrier = CarrierClient::new(&CarrierConfig {
        account_sid: "AC_test".to_string(),
        auth_token: SecretString::from(AUTH_TOKEN),
        from_number: "+15550001111".parse().unwrap(),
        base_url: Url::parse(&format!("{}/", carrier_mock.uri())).unwrap(),
        status_callback_url: Some(Url::parse(&format!("{PUBLIC_BASE}/sms/status")).unwrap()),
        request_timeout: Duration::from_secs(2),
    })
    .unwrap();

    let onboarding_config = OnboardingConfig {
        signup_url_base: Url::parse("https://app.example.com/signup").unwrap(),
        ..OnboardingConfig::default()
    };

    let resolver = Arc::new(PhoneResolver::new(
        identity.clone(),
        ResolverConfig::default(),
    ));
    let engine = Arc::new(OnboardingEngine::new(
        sessions.clone(),
        identity.clone(),
        onboarding_config,
    ));
    let dispatcher = Arc::new(OutboundDispatcher::new(
        carrier.clone(),
        usage.clone(),
        sessions.clone(),
        RetryPolicy::default(),
        CostTable::default(),
        monthly_limit,
    ));
    let router = Arc::new(InboundRouter::new(
        resolver,
        engine,
        dispatcher.clone(),
        usage.clone(),
        agent,
        Arc::new(KeyedMutex::new()),
        Duration::from_secs(25),
    ));

    let app = app(AppState {
        router,
        dispatcher: dispatcher.clone(),
        carrier,
        public_base_url: Url::parse(PUBLIC_BASE).unwrap(),
    });

    TestGateway {
        app,
        db,
        identity,
        usage,
        sessions,
        dispatcher,
        carrier_mock,
    }
}

pub fn signed_post(route: &str, params: &[(String, String)]) -> Request<Body> {
    let url = format!("{PUBLIC_BASE}{route}");
    let sig = signature::compute(AUTH_TOKEN, &url, params);
    let body = serde_urlencoded::to_string(params).unwrap();
    Request::builder()
        .method("POST")
        .uri(route)
        .header("content-type", "application/x-www-form-urlencoded")
        .header(SIGNATURE_HEADER, sig)
        .body(Body::from(body))
        .unwrap()
}

pub fn inbound_params(from: &str, body: &str, sid: &str) -> Vec<(String, String)> {
    vec![
        ("From".to_string(), from.to_string()),
        ("To".to_string(), "+15550001111".to_string()),
        ("Body".to_string(), body.to_string()),
        ("MessageSid".to_string(), sid.to_string()),
        ("AccountSid".to_string(), "AC_test".to_string()),
        ("NumMedia".to_string(), "0".to_string()),
    ]
}

/// Deliver one inbound SMS through the webhook and return the HTTP status.
pub async fn deliver_inbound(
    gateway: &TestGateway,
    from: &str,
    body: &str,
    sid: &str,
) -> StatusCode {
    let request = signed_post("/sms/inbound", &inbound_params(from, body, sid));
    gateway
        .app
        .clone()
        .oneshot(request)
        .await
        .unwrap()
        .status()
}

/// Deliver one status callback through the webhook.
pub async fn deliver_status(
    gateway: &TestGateway,
    sid: &str,
    status: &str,
    error_code: Option<&str>,
) -> StatusCode {
    let mut params = vec![
        ("MessageSid".to_string(), sid.to_string()),
        ("MessageStatus".to_string(), status.to_string()),
    ];
    if let Some(code) = error_code {
        params.push(("ErrorCode".to_string(), code.to_string()));
    }
    let request = signed_post("/sms/status", &params);
    gateway
        .app
        .clone()
        .oneshot(request)
        .await
        .unwrap()
        .status()
}

/// Decoded `Body` fields of every message the carrier mock accepted, in
/// arrival order.
pub async fn replies_sent(gateway: &TestGateway) -> Vec<String> {
    gateway
        .carrier_mock
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| {
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_bytes(&request.body).unwrap();
            pairs
                .into_iter()
                .find(|(k, _)| k == "Body")
                .map(|(_, v)| v)
                .unwrap_or_default()
        })
        .collect()
}

/// Pull the 6-digit code out of a verification reply.
pub fn extract_code(reply: &str) -> String {
    reply
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(6)
        .collect()
}
