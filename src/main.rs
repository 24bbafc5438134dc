//! Composition root: build every component once, serve the carrier
//! webhooks, and run the background tickers until shutdown.

use anyhow::{Context, Result};
use sms_gateway::agent::{AgentError, AgentRuntime};
use sms_gateway::carrier::CarrierClient;
use sms_gateway::config::GatewayConfig;
use sms_gateway::dispatch::{self, OutboundDispatcher};
use sms_gateway::http::{AppState, app};
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
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How often the retry/reconcile ticker fires.
const TICK_PERIOD: Duration = Duration::from_secs(15);

/// Stand-in agent runtime. The real runtime is an external collaborator
/// wired in by the deployment; this binary echoes so the dispatch plane can
/// run end to end on its own.
struct EchoAgent;

#[async_trait::async_trait]
impl AgentRuntime for EchoAgent {
    async fn handle(&self, _user_id: UserId, text: &str) -> Result<String, AgentError> {
        Ok(format!("You said: {text}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_env().context("loading configuration")?;

    let db = Database::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let identity = IdentityStore::new(&db);
    let usage = UsageStore::new(&db);
    let sessions = OnboardingStore::new(&db);

    let carrier = CarrierClient::new(&config.carrier).context("building carrier client")?;

    let resolver = Arc::new(PhoneResolver::new(identity.clone(), config.resolver.clone()));
    let engine = Arc::new(OnboardingEngine::new(
        sessions.clone(),
        identity.clone(),
        config.onboarding.clone(),
    ));
    let dispatcher = Arc::new(OutboundDispatcher::new(
        carrier.clone(),
        usage.clone(),
        sessions,
        config.retry.clone(),
        config.cost.clone(),
        config.monthly_limit,
    ));
    let locks = Arc::new(KeyedMutex::new());
    let router = Arc::new(InboundRouter::new(
        resolver,
        engine,
        dispatcher.clone(),
        usage,
        Arc::new(EchoAgent),
        locks.clone(),
        config.agent_deadline,
    ));

    let cancel = CancellationToken::new();
    let ticker = tokio::spawn(dispatch::run_ticker(
        dispatcher.clone(),
        locks,
        TICK_PERIOD,
        cancel.clone(),
    ));

    let state = AppState {
        router,
        dispatcher,
        carrier,
        public_base_url: config.public_base_url.clone(),
    };
    let application = app(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "sms-gateway listening");

    axum::serve(listener, application)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serving webhooks")?;

    cancel.cancel();
    let _ = ticker.await;
    Ok(())
}
