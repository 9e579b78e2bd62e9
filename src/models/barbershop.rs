use serde::{Deserialize, Serialize};

use super::OpeningHours;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barbershop {
    pub id: String,
    pub name: String,
    pub address: String,
    pub description: String,
    pub image_url: String,
    pub phones: Vec<String>,
    pub opening_hours: OpeningHours,
    pub services: Vec<BarbershopService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarbershopService {
    pub id: String,
    pub barbershop_id: String,
    pub name: String,
    pub description: String,
    pub price_in_cents: i64,
}

impl BarbershopService {
    /// Price in major currency units, as presented to the model.
    pub fn price(&self) -> f64 {
        self.price_in_cents as f64 / 100.0
    }
}
