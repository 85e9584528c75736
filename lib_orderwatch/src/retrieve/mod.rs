//! # Data Retrieval Module
//!
//! HTTP access to the order backend.
//!
//! - **`ky_http`**: a generic `ApiClient` on `reqwest` and `reqwest-middleware`
//!   with exponential-backoff retries for transient failures.
//! - **`order_api`**: the [`EntityFetcher`](crate::core::EntityFetcher) the
//!   watch engine uses to load an order by id.

/// Generic HTTP API client with retry middleware.
pub mod ky_http;
/// Order lookup over the REST API.
pub mod order_api;

pub use ky_http::{ApiClient, ApiResponse};
pub use order_api::OrderApi;
