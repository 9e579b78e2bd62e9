use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use serde::Deserialize;

use super::{CheckoutError, CheckoutProvider, CheckoutRequest, CheckoutSession};
use crate::db::queries;
use crate::models::{BarbershopService, Booking, BookingStatus, User};

const STRIPE_SESSIONS_URL: &str = "https://api.stripe.com/v1/checkout/sessions";

pub struct StripeCheckout {
    secret_key: String,
    app_url: String,
    db: Arc<Mutex<Connection>>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct StripeSession {
    id: String,
    url: Option<String>,
}

impl StripeCheckout {
    pub fn new(secret_key: String, app_url: String, db: Arc<Mutex<Connection>>) -> Self {
        Self {
            secret_key,
            app_url,
            db,
            client: reqwest::Client::new(),
        }
    }

    fn session_form(
        &self,
        caller: &User,
        service: &BarbershopService,
        request: &CheckoutRequest,
    ) -> Vec<(&'static str, String)> {
        let base = self.app_url.trim_end_matches('/');
        vec![
            ("mode", "payment".to_string()),
            ("success_url", format!("{base}/bookings?checkout=success")),
            ("cancel_url", format!("{base}/barbershops/{}", service.barbershop_id)),
            ("customer_email", caller.email.clone()),
            ("line_items[0][quantity]", "1".to_string()),
            ("line_items[0][price_data][currency]", "brl".to_string()),
            ("line_items[0][price_data][unit_amount]", service.price_in_cents.to_string()),
            ("line_items[0][price_data][product_data][name]", service.name.clone()),
            ("metadata[serviceId]", service.id.clone()),
            ("metadata[barbershopId]", service.barbershop_id.clone()),
            ("metadata[userId]", caller.id.clone()),
            ("metadata[date]", request.date.format("%Y-%m-%dT%H:%M:%S").to_string()),
        ]
    }

    /// Holds the slot while the customer pays.
    fn record_pending_booking(
        &self,
        caller: &User,
        service: &BarbershopService,
        request: &CheckoutRequest,
        session_id: &str,
    ) -> anyhow::Result<()> {
        let db = self
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        queries::create_booking(
            &db,
            &Booking {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: caller.id.clone(),
                barbershop_id: service.barbershop_id.clone(),
                service_id: service.id.clone(),
                date: request.date,
                status: BookingStatus::Pending,
                stripe_session_id: Some(session_id.to_string()),
                created_at: Utc::now().naive_utc(),
            },
        )
    }
}

#[async_trait]
impl CheckoutProvider for StripeCheckout {
    async fn create_session(
        &self,
        caller: Option<&User>,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, CheckoutError> {
        let caller = caller.ok_or(CheckoutError::Unauthorized)?;

        if self.secret_key.is_empty() {
            tracing::error!("STRIPE_SECRET_KEY not configured, cannot create checkout session");
            return Err(CheckoutError::Server("Pagamento indisponível no momento".to_string()));
        }

        let service = {
            let db = self
                .db
                .lock()
                .map_err(|_| CheckoutError::Server("database lock poisoned".to_string()))?;
            queries::get_service(&db, &request.service_id)
                .map_err(|e| CheckoutError::Server(e.to_string()))?
        }
        .ok_or_else(|| CheckoutError::Validation("Serviço não encontrado".to_string()))?;

        let resp = self
            .client
            .post(STRIPE_SESSIONS_URL)
            .bearer_auth(&self.secret_key)
            .form(&self.session_form(caller, &service, request))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to call Stripe API");
                CheckoutError::Server("Falha ao contatar o provedor de pagamento".to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "Stripe API returned error");
            return Err(CheckoutError::Server(format!(
                "Provedor de pagamento retornou erro ({status})"
            )));
        }

        let session: StripeSession = resp.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Stripe response");
            CheckoutError::Server("Resposta inesperada do provedor de pagamento".to_string())
        })?;

        let url = session
            .url
            .ok_or_else(|| CheckoutError::Server("Sessão de pagamento sem URL".to_string()))?;

        if let Err(e) = self.record_pending_booking(caller, &service, request, &session.id) {
            tracing::error!(error = %e, session_id = %session.id, "failed to record pending booking");
        }

        tracing::info!(
            session_id = %session.id,
            service_id = %service.id,
            user_id = %caller.id,
            "created checkout session"
        );

        Ok(CheckoutSession { id: session.id, url })
    }
}
