use core::error::Error;

use chrono::NaiveTime;
use derive_more::Display;

pub mod cli;
pub mod daemon;

pub use cli::*;
pub use daemon::*;

/// Configuration errors
#[derive(Debug, Display)]
pub enum ConfigError {
    #[display("Invalid time of day `{value}`, expected HH:MM or HH:MM:SS")]
    InvalidTimeOfDay { value: String },
    #[display("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

impl Error for ConfigError {}

/// Parse a wall-clock time of day such as `02:15` or `03:30:00`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ConfigError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::InvalidTimeOfDay {
            value: value.to_string(),
        })
}
