//! Request-admission core for a multi-tenant LLM developer portal: API-key
//! auth, per-minute rate limits, monthly token quotas, multi-provider
//! dispatch with key rotation, and an append-only request ledger.

pub mod config;
pub mod controller;
pub mod database;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod schema;
pub mod state;
pub mod utils;
