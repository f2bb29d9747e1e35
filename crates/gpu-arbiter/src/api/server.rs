use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::get_processes;
use super::handlers::get_state;
use crate::arbiter::Arbiter;

pub fn routes(arbiter: Arc<Arbiter>) -> impl Endpoint {
    Route::new()
        .at("/api/v1/state", get(get_state))
        .at("/api/v1/processes", get(get_processes))
        .data(arbiter)
        .with(Tracing)
}

/// HTTP server exposing the arbiter status
pub struct ApiServer {
    arbiter: Arc<Arbiter>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(arbiter: Arc<Arbiter>, listen_addr: String) -> Self {
        Self {
            arbiter,
            listen_addr,
        }
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting status API server on {}", self.listen_addr);

        let app = routes(self.arbiter);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("Status API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Status API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                info!("Status API server shutdown requested");
                Ok(())
            }
        }
    }
}
