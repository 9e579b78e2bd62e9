use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use rusqlite::Connection;

use crate::db::queries;
use crate::models::{Booking, OpeningHours};

pub const DEFAULT_SLOT_MINUTES: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum AvailabilityError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Server(String),
}

/// Free time labels ("HH:MM") for a barbershop on a given day.
#[async_trait]
pub trait AvailabilityProvider: Send + Sync {
    async fn available_time_slots(
        &self,
        barbershop_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<String>, AvailabilityError>;
}

/// Computes availability from the catalog: the barbershop's opening hours
/// on a fixed grid, minus booked slots.
pub struct CatalogAvailability {
    db: Arc<Mutex<Connection>>,
    slot_minutes: i64,
}

impl CatalogAvailability {
    pub fn new(db: Arc<Mutex<Connection>>, slot_minutes: i64) -> Self {
        Self { db, slot_minutes }
    }
}

#[async_trait]
impl AvailabilityProvider for CatalogAvailability {
    async fn available_time_slots(
        &self,
        barbershop_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<String>, AvailabilityError> {
        let now = Local::now().naive_local();
        if date < now.date() {
            return Err(AvailabilityError::Validation(
                "Não é possível agendar em datas passadas".to_string(),
            ));
        }

        let (shop, bookings) = {
            let db = self
                .db
                .lock()
                .map_err(|_| AvailabilityError::Server("database lock poisoned".to_string()))?;
            let shop = queries::get_barbershop(&db, barbershop_id)
                .map_err(|e| AvailabilityError::Server(e.to_string()))?
                .ok_or_else(|| AvailabilityError::Validation("Barbearia não encontrada".to_string()))?;
            let bookings = queries::get_bookings_for_barbershop_on(&db, barbershop_id, date)
                .map_err(|e| AvailabilityError::Server(e.to_string()))?;
            (shop, bookings)
        };

        Ok(free_slots(&shop.opening_hours, &bookings, date, now, self.slot_minutes))
    }
}

/// Grid slots on `date` that are neither booked nor already past at `now`.
pub fn free_slots(
    hours: &OpeningHours,
    bookings: &[Booking],
    date: NaiveDate,
    now: NaiveDateTime,
    slot_minutes: i64,
) -> Vec<String> {
    hours
        .time_grid(date, slot_minutes)
        .into_iter()
        .map(|time| date.and_time(time))
        .filter(|slot| *slot > now)
        .filter(|slot| !bookings.iter().any(|b| b.date == *slot))
        .map(|slot| slot.format("%H:%M").to_string())
        .collect()
}
