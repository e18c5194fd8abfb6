//! Lead Sniper library.
//!
//! Turns a raw business-registry export into a scored, tiered lead list:
//! refinery → enrichment → scoring → message synthesis, driven in chunks by
//! the pipeline.
//!
//! # Modules
//!
//! - `cache_store`: Category/TTL cache with stale reads and snapshots.
//! - `cache_validator`: Checksum-sealed snapshot entries.
//! - `circuit_breaker`: Per-gateway circuit breaker.
//! - `config`: Configuration management.
//! - `enrichment`: Wealth, infrastructure, tax and renewal layers.
//! - `errors`: Error handling types.
//! - `gateway_client`: Shared HTTP transport for external sources.
//! - `geo`: Great-circle distance.
//! - `market_data`: Bundled, versioned market data asset.
//! - `models`: Core data models.
//! - `pipeline`: Batch orchestrator and run statistics.
//! - `refinery`: Column mapping, validation and normalization.
//! - `scoring`: Scoring matrix and tiers.
//! - `services`: Vehicle registry, fuel price and charger directory clients.
//! - `synthesis`: Outreach messages and the narrative plugin.

pub mod cache_store;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod enrichment;
pub mod errors;
pub mod gateway_client;
pub mod geo;
pub mod market_data;
pub mod models;
pub mod pipeline;
pub mod refinery;
pub mod scoring;
pub mod services;
pub mod synthesis;
