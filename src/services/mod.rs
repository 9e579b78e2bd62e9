pub mod ai;
pub mod availability;
pub mod checkout;
pub mod idempotency;
pub mod orchestrator;
pub mod policy;
pub mod redact;
pub mod redirect;
pub mod tools;
