use rusqlite::Connection;

use super::queries;
use crate::models::{Barbershop, BarbershopService, OpeningHours};

const WEEKDAYS_9_TO_19: &str = r#"{"slots":[
    {"day":"mon","start":"09:00","end":"19:00"},
    {"day":"tue","start":"09:00","end":"19:00"},
    {"day":"wed","start":"09:00","end":"19:00"},
    {"day":"thu","start":"09:00","end":"19:00"},
    {"day":"fri","start":"09:00","end":"19:00"},
    {"day":"sat","start":"09:00","end":"14:00"}
]}"#;

const SERVICES: &[(&str, &str, &str, i64)] = &[
    ("corte", "Corte de Cabelo", "Estilo personalizado com as últimas tendências.", 6000),
    ("barba", "Barba", "Modelagem completa para destacar sua masculinidade.", 4000),
    ("pezinho", "Pézinho", "Acabamento perfeito para um visual renovado.", 3500),
    ("sobrancelha", "Sobrancelha", "Expressão acentuada com modelagem precisa.", 2000),
    ("hidratacao", "Hidratação", "Fios hidratados, macios e brilhantes.", 2500),
];

/// Inserts a small demo catalog when no barbershop exists yet. Returns the
/// number of barbershops inserted.
pub fn seed_demo_catalog(conn: &Connection) -> anyhow::Result<usize> {
    if !queries::list_barbershops(conn)?.is_empty() {
        return Ok(0);
    }

    let shops = [
        ("vintage-barber", "Vintage Barber", "Rua das Flores, 120 - Centro", "(11) 98204-5108"),
        ("barbearia-do-matuto", "Barbearia do Matuto", "Av. Paulista, 900 - Bela Vista", "(11) 97632-1144"),
        ("corte-e-navalha", "Corte & Navalha", "Rua Augusta, 455 - Consolação", "(11) 99170-2233"),
    ];

    let tx = conn.unchecked_transaction()?;
    for (i, (id, name, address, phone)) in shops.iter().enumerate() {
        let services = SERVICES
            .iter()
            .map(|(key, service, description, price)| BarbershopService {
                id: format!("{id}-{key}"),
                barbershop_id: id.to_string(),
                name: service.to_string(),
                description: description.to_string(),
                // Each shop prices a little differently.
                price_in_cents: price + 500 * i as i64,
            })
            .collect();

        queries::insert_barbershop(
            &tx,
            &Barbershop {
                id: id.to_string(),
                name: name.to_string(),
                address: address.to_string(),
                description: format!("{name}: tradição e estilo em cada corte."),
                image_url: String::new(),
                phones: vec![phone.to_string()],
                opening_hours: OpeningHours::from_json(WEEKDAYS_9_TO_19)?,
                services,
            },
        )?;
    }
    tx.commit()?;

    tracing::info!(barbershops = shops.len(), "seeded demo catalog");
    Ok(shops.len())
}
