//! Pure classification of GPU processes and inbound inference requests.

pub mod process;
pub mod request;

pub use process::ProcessClass;
pub use process::ProcessPatterns;
pub use request::is_gpu_intensive;
pub use request::parse_body;
