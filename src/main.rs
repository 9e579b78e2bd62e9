use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use agenda::config::AppConfig;
use agenda::db;
use agenda::handlers;
use agenda::services::ai::groq::GroqProvider;
use agenda::services::ai::ollama::OllamaProvider;
use agenda::services::ai::rules::PolicyProvider;
use agenda::services::ai::LlmProvider;
use agenda::services::availability::CatalogAvailability;
use agenda::services::checkout::stripe::StripeCheckout;
use agenda::services::idempotency::{spawn_sweeper, IdempotencyCache, IdempotencyStore};
use agenda::services::orchestrator::Orchestrator;
use agenda::services::tools::Toolbox;
use agenda::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    let conn = db::init_db(&config.database_url)?;
    if config.seed_demo_data {
        db::seed::seed_demo_catalog(&conn)?;
    }
    let db = Arc::new(Mutex::new(conn));

    let llm: Arc<dyn LlmProvider> = match config.llm_provider.as_str() {
        "groq" => {
            anyhow::ensure!(!config.groq_api_key.is_empty(), "GROQ_API_KEY must be set when LLM_PROVIDER=groq");
            tracing::info!("using Groq LLM provider (model: {})", config.groq_model);
            Arc::new(GroqProvider::new(config.groq_api_key.clone(), config.groq_model.clone()))
        }
        "rules" => {
            tracing::info!("using rule-based conversation provider");
            Arc::new(PolicyProvider::new())
        }
        _ => {
            tracing::info!("using Ollama LLM provider (url: {}, model: {})", config.ollama_url, config.ollama_model);
            Arc::new(OllamaProvider::new(config.ollama_url.clone(), config.ollama_model.clone()))
        }
    };

    if config.dev_login {
        tracing::warn!("DEV_LOGIN enabled, anyone can sign in by email");
    }

    if config.stripe_secret_key.is_empty() {
        tracing::warn!("STRIPE_SECRET_KEY not set, checkout sessions will fail");
    }

    let idempotency = Arc::new(IdempotencyCache::new(Duration::from_secs(
        config.checkout_retention_minutes * 60,
    )));
    let sweeper = spawn_sweeper(
        idempotency.clone() as Arc<dyn IdempotencyStore>,
        Duration::from_secs(config.checkout_sweep_minutes.max(1) * 60),
    );

    let toolbox = Toolbox::new(
        db.clone(),
        Arc::new(CatalogAvailability::new(db.clone(), config.slot_interval_minutes)),
        Arc::new(StripeCheckout::new(
            config.stripe_secret_key.clone(),
            config.app_url.clone(),
            db.clone(),
        )),
        idempotency,
    );
    let orchestrator = Orchestrator::new(llm, Arc::new(toolbox), config.chat_max_steps);
    tracing::info!(max_steps = orchestrator.max_steps(), "chat orchestrator ready");

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        orchestrator,
    });

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api/chat", post(handlers::chat::chat))
        .route("/api/barbershops", get(handlers::barbershops::list_barbershops))
        .route("/api/barbershops/:id", get(handlers::barbershops::get_barbershop))
        .route("/api/dev/session", post(handlers::dev::create_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.stop();
    tracing::info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
