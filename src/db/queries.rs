use chrono::{NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::{Barbershop, BarbershopService, Booking, BookingStatus, OpeningHours, User};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ── Barbershops ──

pub fn insert_barbershop(conn: &Connection, shop: &Barbershop) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO barbershops (id, name, address, description, image_url, opening_hours, phones)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            shop.id,
            shop.name,
            shop.address,
            shop.description,
            shop.image_url,
            shop.opening_hours.to_json(),
            serde_json::to_string(&shop.phones)?,
        ],
    )?;

    for service in &shop.services {
        insert_service(conn, service)?;
    }
    Ok(())
}

pub fn insert_service(conn: &Connection, service: &BarbershopService) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO barbershop_services (id, barbershop_id, name, description, price_in_cents)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            service.id,
            service.barbershop_id,
            service.name,
            service.description,
            service.price_in_cents,
        ],
    )?;
    Ok(())
}

pub fn list_barbershops(conn: &Connection) -> anyhow::Result<Vec<Barbershop>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, address, description, image_url, opening_hours, phones
         FROM barbershops ORDER BY name ASC",
    )?;
    let rows = stmt.query_map([], |row| Ok(parse_barbershop_row(row)))?;

    let mut shops = vec![];
    for row in rows {
        let mut shop = row??;
        shop.services = get_services_for_barbershop(conn, &shop.id)?;
        shops.push(shop);
    }
    Ok(shops)
}

/// All barbershops whose name contains `name`, ignoring case. A missing or
/// blank name matches every barbershop.
pub fn search_barbershops(conn: &Connection, name: Option<&str>) -> anyhow::Result<Vec<Barbershop>> {
    let shops = list_barbershops(conn)?;
    let needle = match name.map(str::trim) {
        Some(n) if !n.is_empty() => n.to_lowercase(),
        _ => return Ok(shops),
    };

    Ok(shops
        .into_iter()
        .filter(|shop| shop.name.to_lowercase().contains(&needle))
        .collect())
}

pub fn get_barbershop(conn: &Connection, id: &str) -> anyhow::Result<Option<Barbershop>> {
    let result = conn
        .query_row(
            "SELECT id, name, address, description, image_url, opening_hours, phones
             FROM barbershops WHERE id = ?1",
            params![id],
            |row| Ok(parse_barbershop_row(row)),
        )
        .optional()?;

    match result {
        Some(shop) => {
            let mut shop = shop?;
            shop.services = get_services_for_barbershop(conn, &shop.id)?;
            Ok(Some(shop))
        }
        None => Ok(None),
    }
}

pub fn get_service(conn: &Connection, id: &str) -> anyhow::Result<Option<BarbershopService>> {
    let service = conn
        .query_row(
            "SELECT id, barbershop_id, name, description, price_in_cents
             FROM barbershop_services WHERE id = ?1",
            params![id],
            parse_service_row,
        )
        .optional()?;
    Ok(service)
}

fn get_services_for_barbershop(
    conn: &Connection,
    barbershop_id: &str,
) -> anyhow::Result<Vec<BarbershopService>> {
    let mut stmt = conn.prepare(
        "SELECT id, barbershop_id, name, description, price_in_cents
         FROM barbershop_services WHERE barbershop_id = ?1 ORDER BY name ASC",
    )?;
    let rows = stmt.query_map(params![barbershop_id], parse_service_row)?;

    let mut services = vec![];
    for row in rows {
        services.push(row?);
    }
    Ok(services)
}

fn parse_barbershop_row(row: &rusqlite::Row) -> anyhow::Result<Barbershop> {
    let opening_hours_json: String = row.get(5)?;
    let opening_hours = OpeningHours::from_json(&opening_hours_json).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "invalid opening hours, falling back to default");
        OpeningHours::default()
    });
    let phones_json: String = row.get(6)?;
    let phones = serde_json::from_str(&phones_json).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "invalid phone list, ignoring");
        vec![]
    });

    Ok(Barbershop {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        description: row.get(3)?,
        image_url: row.get(4)?,
        phones,
        opening_hours,
        services: vec![],
    })
}

fn parse_service_row(row: &rusqlite::Row) -> rusqlite::Result<BarbershopService> {
    Ok(BarbershopService {
        id: row.get(0)?,
        barbershop_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        price_in_cents: row.get(4)?,
    })
}

// ── Bookings ──

pub fn create_booking(conn: &Connection, booking: &Booking) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO bookings (id, user_id, barbershop_id, service_id, date, status, stripe_session_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            booking.id,
            booking.user_id,
            booking.barbershop_id,
            booking.service_id,
            booking.date.format(DATETIME_FORMAT).to_string(),
            booking.status.as_str(),
            booking.stripe_session_id,
            booking.created_at.format(DATETIME_FORMAT).to_string(),
        ],
    )?;
    Ok(())
}

/// Non-cancelled bookings of a barbershop on `date`, earliest first.
pub fn get_bookings_for_barbershop_on(
    conn: &Connection,
    barbershop_id: &str,
    date: NaiveDate,
) -> anyhow::Result<Vec<Booking>> {
    let day_start = date.format("%Y-%m-%d 00:00:00").to_string();
    let day_end = date.format("%Y-%m-%d 23:59:59").to_string();

    let mut stmt = conn.prepare(
        "SELECT id, user_id, barbershop_id, service_id, date, status, stripe_session_id, created_at
         FROM bookings
         WHERE barbershop_id = ?1 AND date >= ?2 AND date <= ?3 AND status != 'cancelled'
         ORDER BY date ASC",
    )?;
    let rows = stmt.query_map(params![barbershop_id, day_start, day_end], |row| {
        Ok(parse_booking_row(row))
    })?;

    let mut bookings = vec![];
    for row in rows {
        bookings.push(row??);
    }
    Ok(bookings)
}

fn parse_booking_row(row: &rusqlite::Row) -> anyhow::Result<Booking> {
    let date_str: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let created_at_str: String = row.get(7)?;

    let date = NaiveDateTime::parse_from_str(&date_str, DATETIME_FORMAT)?;
    let created_at = NaiveDateTime::parse_from_str(&created_at_str, DATETIME_FORMAT)
        .unwrap_or_else(|_| Utc::now().naive_utc());

    Ok(Booking {
        id: row.get(0)?,
        user_id: row.get(1)?,
        barbershop_id: row.get(2)?,
        service_id: row.get(3)?,
        date,
        status: BookingStatus::parse(&status_str),
        stripe_session_id: row.get(6)?,
        created_at,
    })
}

// ── Users & sessions ──

pub fn create_user(conn: &Connection, user: &User) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO users (id, name, email) VALUES (?1, ?2, ?3)",
        params![user.id, user.name, user.email],
    )?;
    Ok(())
}

pub fn create_session(
    conn: &Connection,
    token: &str,
    user_id: &str,
    expires_at: &NaiveDateTime,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
        params![token, user_id, expires_at.format(DATETIME_FORMAT).to_string()],
    )?;
    Ok(())
}

pub fn get_user_by_email(conn: &Connection, email: &str) -> anyhow::Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT id, name, email FROM users WHERE lower(email) = lower(?1)",
            params![email],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

/// The user owning an unexpired session token.
pub fn get_user_by_session(conn: &Connection, token: &str) -> anyhow::Result<Option<User>> {
    let now = Utc::now().naive_utc().format(DATETIME_FORMAT).to_string();
    let user = conn
        .query_row(
            "SELECT u.id, u.name, u.email FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = ?1 AND s.expires_at > ?2",
            params![token, now],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}
