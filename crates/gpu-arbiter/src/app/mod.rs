//! Application module
//!
//! Wiring of the daemon: building the services, spawning the long-running
//! tasks and waiting for shutdown.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
