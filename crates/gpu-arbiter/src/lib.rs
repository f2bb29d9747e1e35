//! GPU arbiter
//!
//! Shares a single GPU between a latency-sensitive inference service, reached
//! through a request-aware reverse proxy, and a background job running in a
//! managed unit whenever the GPU is otherwise idle.

pub mod api;
pub mod app;
pub mod arbiter;
pub mod classifier;
pub mod config;
pub mod logging;
pub mod mock;
pub mod monitor;
pub mod probe;
pub mod proxy;
pub mod telemetry;
pub mod unit;
