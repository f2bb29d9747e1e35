//! Request-aware forwarding gate in front of the inference service.
//!
//! Every request is classified before it is forwarded. GPU-intensive requests
//! preempt the background unit and wait a settle delay; everything else is
//! forwarded untouched. Responses are relayed as a stream.

use core::error::Error;

use derive_more::Display;

pub mod gate;
pub mod headers;
mod relay;
pub mod server;

pub use gate::ForwardingGate;
pub use gate::GateConfig;
pub use server::ProxyServer;

/// Proxy errors
#[derive(Debug, Display)]
pub enum ProxyError {
    #[display("Failed to build upstream HTTP client")]
    Client,
    #[display("Upstream request to {url} failed")]
    Upstream { url: String },
    #[display("Proxy server error: {message}")]
    ServerError { message: String },
}

impl Error for ProxyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_error_display_formatting() {
        let upstream = ProxyError::Upstream {
            url: "http://10.0.0.5:11434/api/chat".to_string(),
        };
        assert_eq!(
            upstream.to_string(),
            "Upstream request to http://10.0.0.5:11434/api/chat failed"
        );

        let server = ProxyError::ServerError {
            message: "address in use".to_string(),
        };
        assert_eq!(server.to_string(), "Proxy server error: address in use");
    }
}
