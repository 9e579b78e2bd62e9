use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::queries;
use crate::errors::AppError;
use crate::models::Barbershop;
use crate::services::tools::BarbershopSummary;
use crate::state::AppState;

// GET /api/barbershops?search=
#[derive(Deserialize)]
pub struct SearchQuery {
    pub search: Option<String>,
}

pub async fn list_barbershops(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<BarbershopSummary>>, AppError> {
    let shops = {
        let db = state
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        queries::search_barbershops(&db, query.search.as_deref())?
    };

    Ok(Json(shops.into_iter().map(BarbershopSummary::from).collect()))
}

// GET /api/barbershops/:id
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BarbershopDetail {
    pub id: String,
    pub name: String,
    pub address: String,
    pub description: String,
    pub image_url: String,
    pub phones: Vec<String>,
    pub opening_hours: String,
    pub services: Vec<ServiceDetail>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDetail {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: f64,
}

impl From<Barbershop> for BarbershopDetail {
    fn from(shop: Barbershop) -> Self {
        Self {
            opening_hours: shop.opening_hours.to_human_readable(),
            services: shop
                .services
                .into_iter()
                .map(|s| ServiceDetail {
                    price: s.price(),
                    id: s.id,
                    name: s.name,
                    description: s.description,
                })
                .collect(),
            id: shop.id,
            name: shop.name,
            address: shop.address,
            description: shop.description,
            image_url: shop.image_url,
            phones: shop.phones,
        }
    }
}

pub async fn get_barbershop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BarbershopDetail>, AppError> {
    let shop = {
        let db = state
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
        queries::get_barbershop(&db, &id)?
    };

    shop.map(|s| Json(BarbershopDetail::from(s)))
        .ok_or_else(|| AppError::NotFound(format!("barbershop {id}")))
}
