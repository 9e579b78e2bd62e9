pub mod stripe;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::models::User;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutRequest {
    pub service_id: String,
    pub date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Server(String),
}

/// Creates a hosted payment session for booking a service.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn create_session(
        &self,
        caller: Option<&User>,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, CheckoutError>;
}
