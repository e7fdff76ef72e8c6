//! Core library for the `wxfetch` CLI.
//!
//! This crate defines:
//! - Normalized weather readings and the provider adapters that produce them
//! - Retry with backoff, per-provider circuit breakers and a freshness-tiered cache
//! - The orchestrator that chains them into a single resilient fetch
//!
//! It is used by `wxfetch-cli`, but can also be embedded by other binaries or services.

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod elevation;
pub mod error;
pub mod geocode;
pub mod model;
pub mod orchestrator;
pub mod provider;
pub mod retry;
pub mod store;

pub use cache::{CacheManager, CachedWeather, Freshness};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use config::{Config, ProviderConfig, WeatherSettings};
pub use error::{ErrorCode, WeatherError};
pub use model::NormalizedWeather;
pub use orchestrator::{FetchResult, ProviderStatus, WeatherOrchestrator};
pub use provider::{ProviderId, WeatherProvider};
pub use retry::RetryConfig;
pub use store::{FileStore, KeyValueStore, MemoryStore};
