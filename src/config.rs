use std::env;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub llm_provider: String,
    pub groq_api_key: String,
    pub groq_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub stripe_secret_key: String,
    /// Base URL for checkout success/cancel redirects.
    pub app_url: String,
    pub chat_max_steps: usize,
    pub checkout_retention_minutes: u64,
    pub checkout_sweep_minutes: u64,
    pub slot_interval_minutes: i64,
    /// Insert the demo catalog at startup when the database has none.
    pub seed_demo_data: bool,
    /// Enables `POST /api/dev/session`, which signs in by email alone.
    pub dev_login: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: parsed("PORT", 3000),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "agenda.db".to_string()),
            llm_provider: env::var("LLM_PROVIDER").unwrap_or_else(|_| "ollama".to_string()),
            groq_api_key: env::var("GROQ_API_KEY").unwrap_or_default(),
            groq_model: env::var("GROQ_MODEL").unwrap_or_else(|_| "llama-3.3-70b-versatile".to_string()),
            ollama_url: env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string()),
            ollama_model: env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2".to_string()),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            app_url: env::var("APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string()),
            chat_max_steps: parsed("CHAT_MAX_STEPS", 10),
            checkout_retention_minutes: parsed("CHECKOUT_RETENTION_MINUTES", 10),
            checkout_sweep_minutes: parsed("CHECKOUT_SWEEP_MINUTES", 5),
            slot_interval_minutes: parsed("SLOT_INTERVAL_MINUTES", 30),
            seed_demo_data: parsed("SEED_DEMO_DATA", true),
            dev_login: parsed("DEV_LOGIN", false),
        }
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
