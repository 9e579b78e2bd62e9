pub mod migrations;
pub mod queries;
pub mod seed;

use std::path::Path;

use anyhow::Context;
use rusqlite::Connection;

const MIGRATIONS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations");

pub fn init_db(path: &str) -> anyhow::Result<Connection> {
    let conn = Connection::open(path).context("failed to open database")?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        .context("failed to set database pragmas")?;

    migrations::run_migrations(&conn, Path::new(MIGRATIONS_DIR))?;

    Ok(conn)
}
