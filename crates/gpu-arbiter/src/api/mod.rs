//! Read-only status API for the arbiter
//!
//! Served on its own listen address so that no path of the proxied inference
//! service is shadowed.
//!
//! # API Endpoints
//!
//! - `GET /api/v1/state` - arbiter state, unit id and blackout window
//! - `GET /api/v1/processes` - current GPU processes with their classification

pub mod errors;
pub mod handlers;
pub mod server;
pub mod types;

pub use errors::ApiError;
pub use server::ApiServer;
