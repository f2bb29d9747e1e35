use std::sync::Arc;

use error_stack::Report;
use poem::handler;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::Body;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Request;
use poem::Response;
use poem::Server;
use tokio_util::sync::CancellationToken;

use super::ForwardingGate;
use super::ProxyError;

/// Catch-all handler: every method and path goes through the gate.
#[handler]
async fn forward(req: &Request, body: Body, gate: Data<&Arc<ForwardingGate>>) -> Response {
    gate.handle(req, body).await
}

/// Endpoint serving every path through `gate`.
pub fn endpoint(gate: Arc<ForwardingGate>) -> impl Endpoint<Output = Response> {
    forward.data(gate).with(Tracing)
}

/// Reverse proxy listening in front of the inference service
pub struct ProxyServer {
    gate: Arc<ForwardingGate>,
    listen_addr: String,
}

impl ProxyServer {
    pub fn new(gate: Arc<ForwardingGate>, listen_addr: String) -> Self {
        Self { gate, listen_addr }
    }

    /// Serve until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::ServerError`] if the listener cannot bind or the server fails
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ProxyError>> {
        tracing::info!(
            "Starting proxy on {} forwarding to {}",
            self.listen_addr,
            self.gate.config().upstream_base
        );

        let app = endpoint(self.gate);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        tracing::info!("Proxy server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("Proxy server failed: {e}");
                        Err(Report::new(ProxyError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                tracing::info!("Proxy server shutdown requested");
                Ok(())
            }
        }
    }
}
