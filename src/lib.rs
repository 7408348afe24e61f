//! pulse-node - smart-meter ingestion with a hash-chained prediction ledger
//!
//! Meter readings arrive over NATS (or the HTTP fallback), are priced by a
//! deterministic factor model, stored, and logged to an append-only ledger
//! whose blocks can be audited later.
//!
//! ## Services
//!
//! - **Registry**: meter id to household resolution
//! - **Pricing**: household and context-free factor models
//! - **Ledger**: single in-memory chain with durable log records
//! - **Gateway**: per-reading pipeline with detached ledger confirmation
//! - **Query**: read-only views for stats, verification and blocks
//! - **Transport / Simulator**: NATS subjects and synthetic meters

pub mod api;
pub mod config;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod node;
pub mod pricing;
pub mod query;
pub mod registry;
pub mod simulator;
pub mod store;
pub mod transport;

pub use config::Config;
pub use gateway::{IngestOutcome, IngestionGateway};
pub use ledger::LedgerService;
pub use node::Services;
pub use pricing::PricingEngine;
