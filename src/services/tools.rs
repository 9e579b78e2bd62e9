//! Backend operations the assistant may call during a conversation.
//!
//! Every tool returns a plain JSON result. Failures are folded into the
//! result (`{ error }` or `{ success: false, error }`) so the model can
//! narrate them; nothing is propagated past this module.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::queries;
use crate::models::{Barbershop, User};
use crate::services::availability::{AvailabilityError, AvailabilityProvider};
use crate::services::checkout::{CheckoutError, CheckoutProvider, CheckoutRequest};
use crate::services::idempotency::{checkout_key, IdempotencyStore};

pub const DUPLICATE_BOOKING: &str = "Duplicate booking";
pub const UNAUTHORIZED: &str = "Unauthorized";
pub const INVALID_DATE: &str = "Data inválida";
pub const SLOTS_FAILED: &str = "Erro ao buscar horários disponíveis";
pub const NO_SLOTS: &str = "Nenhum horário disponível nesta data";
pub const SEARCH_FAILED: &str = "Erro ao buscar barbearias";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    SearchBarbershops,
    GetAvailableTimeSlots,
    CreateCheckoutSession,
}

impl ToolName {
    pub const ALL: [ToolName; 3] = [
        ToolName::SearchBarbershops,
        ToolName::GetAvailableTimeSlots,
        ToolName::CreateCheckoutSession,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::SearchBarbershops => "searchBarbershops",
            ToolName::GetAvailableTimeSlots => "getAvailableTimeSlotsForBarbershop",
            ToolName::CreateCheckoutSession => "createCheckoutSession",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn spec(&self) -> ToolSpec {
        match self {
            ToolName::SearchBarbershops => ToolSpec {
                name: self.as_str(),
                description: "Pesquisa barbearias pelo nome. Se nenhum nome for informado, retorna todas as barbearias com seus serviços.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Nome (ou parte do nome) da barbearia"}
                    },
                    "additionalProperties": false
                }),
            },
            ToolName::GetAvailableTimeSlots => ToolSpec {
                name: self.as_str(),
                description: "Obtém os horários disponíveis de uma barbearia em uma data específica.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "barbershopId": {"type": "string", "description": "ID da barbearia"},
                        "date": {"type": "string", "description": "Data no formato YYYY-MM-DD"}
                    },
                    "required": ["barbershopId", "date"],
                    "additionalProperties": false
                }),
            },
            ToolName::CreateCheckoutSession => ToolSpec {
                name: self.as_str(),
                description: "Cria a sessão de pagamento para agendar um serviço em uma data e horário. Use APENAS UMA VEZ por confirmação explícita do usuário.",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "serviceId": {"type": "string", "description": "ID do serviço retornado por searchBarbershops"},
                        "date": {"type": "string", "description": "Data e horário em ISO (YYYY-MM-DDTHH:mm:ss)"}
                    },
                    "required": ["serviceId", "date"],
                    "additionalProperties": false
                }),
            },
        }
    }
}

/// Declaration handed to the model: name, when to use it, and the JSON
/// schema its arguments must satisfy.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchBarbershopsInput {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeSlotsInput {
    pub barbershop_id: String,
    pub date: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CheckoutInput {
    pub service_id: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarbershopSummary {
    pub barbershop_id: String,
    pub name: String,
    pub address: String,
    pub services: Vec<ServiceSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    pub price: f64,
}

impl From<Barbershop> for BarbershopSummary {
    fn from(shop: Barbershop) -> Self {
        Self {
            barbershop_id: shop.id,
            name: shop.name,
            address: shop.address,
            services: shop
                .services
                .iter()
                .map(|s| ServiceSummary {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    price: s.price(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlots {
    pub barbershop_id: String,
    pub date: String,
    pub available_time_slots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeSlotsOutput {
    Available(TimeSlots),
    Failed(ToolFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckoutOutput {
    pub fn created(url: String, checkout_session_id: String) -> Self {
        Self {
            success: true,
            url: Some(url),
            checkout_session_id: Some(checkout_session_id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            checkout_session_id: None,
            error: Some(error.into()),
        }
    }
}

/// Per-request data the tools need beyond their arguments.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub caller: Option<User>,
}

pub struct Toolbox {
    db: Arc<Mutex<Connection>>,
    availability: Arc<dyn AvailabilityProvider>,
    checkout: Arc<dyn CheckoutProvider>,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl Toolbox {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        availability: Arc<dyn AvailabilityProvider>,
        checkout: Arc<dyn CheckoutProvider>,
        idempotency: Arc<dyn IdempotencyStore>,
    ) -> Self {
        Self {
            db,
            availability,
            checkout,
            idempotency,
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        ToolName::ALL.iter().map(ToolName::spec).collect()
    }

    /// Validates `input` against the tool's schema and runs it.
    pub async fn execute(&self, ctx: &ToolContext, name: &str, input: &Value) -> Value {
        let Some(tool) = ToolName::parse(name) else {
            tracing::warn!(tool = name, "model requested unknown tool");
            return json!({ "error": format!("Ferramenta desconhecida: {name}") });
        };

        tracing::info!(tool = tool.as_str(), "executing tool");

        match tool {
            ToolName::SearchBarbershops => match parse_input::<SearchBarbershopsInput>(input) {
                Ok(args) => match self.search_barbershops(args.name.as_deref()) {
                    Ok(shops) => to_value(&shops),
                    Err(e) => {
                        tracing::error!(error = %e, "barbershop search failed");
                        to_value(&ToolFailure {
                            error: SEARCH_FAILED.to_string(),
                        })
                    }
                },
                Err(error) => json!({ "error": error }),
            },
            ToolName::GetAvailableTimeSlots => match parse_input::<TimeSlotsInput>(input) {
                Ok(args) => to_value(&self.available_time_slots(&args).await),
                Err(error) => json!({ "error": error }),
            },
            ToolName::CreateCheckoutSession => match parse_input::<CheckoutInput>(input) {
                Ok(args) => to_value(&self.create_checkout_session(ctx, &args).await),
                Err(error) => to_value(&CheckoutOutput::failed(error)),
            },
        }
    }

    pub fn search_barbershops(&self, name: Option<&str>) -> anyhow::Result<Vec<BarbershopSummary>> {
        let shops = {
            let db = self
                .db
                .lock()
                .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
            queries::search_barbershops(&db, name)?
        };
        Ok(shops.into_iter().map(BarbershopSummary::from).collect())
    }

    pub async fn available_time_slots(&self, args: &TimeSlotsInput) -> TimeSlotsOutput {
        let failed = |error: &str| {
            TimeSlotsOutput::Failed(ToolFailure {
                error: error.to_string(),
            })
        };

        let Ok(date) = NaiveDate::parse_from_str(args.date.trim(), "%Y-%m-%d") else {
            return failed(INVALID_DATE);
        };

        match self.availability.available_time_slots(&args.barbershop_id, date).await {
            Ok(slots) if slots.is_empty() => failed(NO_SLOTS),
            Ok(slots) => TimeSlotsOutput::Available(TimeSlots {
                barbershop_id: args.barbershop_id.clone(),
                date: args.date.clone(),
                available_time_slots: slots,
            }),
            Err(AvailabilityError::Validation(message)) => failed(&message),
            Err(AvailabilityError::Server(message)) => {
                tracing::error!(
                    barbershop_id = %args.barbershop_id,
                    error = %message,
                    "availability lookup failed"
                );
                failed(SLOTS_FAILED)
            }
        }
    }

    pub async fn create_checkout_session(&self, ctx: &ToolContext, args: &CheckoutInput) -> CheckoutOutput {
        let Some(date) = parse_iso_datetime(&args.date) else {
            return CheckoutOutput::failed(INVALID_DATE);
        };

        let key = checkout_key(&args.service_id, &args.date);
        if !self.idempotency.try_reserve(&key) {
            tracing::warn!(key = %key, "duplicate checkout attempt blocked");
            return CheckoutOutput::failed(DUPLICATE_BOOKING);
        }

        let request = CheckoutRequest {
            service_id: args.service_id.clone(),
            date,
        };

        match self.checkout.create_session(ctx.caller.as_ref(), &request).await {
            Ok(session) => {
                self.idempotency.record(&key);
                CheckoutOutput::created(session.url, session.id)
            }
            Err(e) => {
                self.idempotency.release(&key);
                match e {
                    CheckoutError::Unauthorized => CheckoutOutput::failed(UNAUTHORIZED),
                    CheckoutError::Validation(message) => CheckoutOutput::failed(message),
                    CheckoutError::Server(message) => {
                        tracing::error!(error = %message, "checkout session creation failed");
                        CheckoutOutput::failed(message)
                    }
                }
            }
        }
    }
}

/// Accepts RFC 3339 timestamps and naive `YYYY-MM-DDTHH:MM[:SS[.fff]]`
/// wall-clock times. A timestamp with an offset is converted to the server's
/// local time, the same clock the slot grid and bookings use.
pub fn parse_iso_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn parse_input<T: DeserializeOwned>(input: &Value) -> Result<T, String> {
    // Models sometimes send `null` for tools without required arguments.
    let input = if input.is_null() { json!({}) } else { input.clone() };
    serde_json::from_value(input).map_err(|e| format!("Parâmetros inválidos: {e}"))
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}
