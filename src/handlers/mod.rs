pub mod barbershops;
pub mod chat;
pub mod dev;
pub mod health;
