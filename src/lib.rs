//! Electricity Plan Pricing API Library
//!
//! This library provides the core functionality for the plan pricing API:
//! resilient access to the upstream pricing service, utility territory
//! resolution for Texas addresses and ZIP codes, data models, and HTTP
//! handlers.
//!
//! # Modules
//!
//! - `cache`: Tiered cache (in-memory + optional distributed) with tag invalidation.
//! - `cache_validator`: Checksum envelope for distributed cache payloads.
//! - `circuit_breaker`: Circuit breaker guarding the upstream pricing API.
//! - `config`: Configuration management.
//! - `errors`: Error handling types.
//! - `fallback`: Geographic fallback chain for territory resolution.
//! - `handlers`: HTTP request handlers.
//! - `models`: Core data models.
//! - `plan_client`: Resilient plan data client (cache, coalescing, retries, snapshots).
//! - `pricing_client`: Low-level upstream pricing API client.
//! - `rate_limiter`: Fixed-window rate limiters (global and per-client).
//! - `resolution_client`: Client for the address resolution sub-service.
//! - `resolver`: Territory resolution engine.
//! - `snapshot`: Last-good plan snapshots for degraded operation.
//! - `tdsp`: Texas utility territory reference data.

// Re-export primary modules for shared use in tests and other binaries
pub mod cache;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod handlers;
pub mod models;
pub mod plan_client;
pub mod pricing_client;
pub mod rate_limiter;
pub mod resolution_client;
pub mod resolver;
pub mod snapshot;
pub mod tdsp;
