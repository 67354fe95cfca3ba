use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::filter;
use super::handlers::index;
use super::handlers::ExtenderContext;

/// HTTP server exposing the extender filter protocol.
pub struct ExtenderServer {
    context: Arc<ExtenderContext>,
    listen_addr: String,
}

impl ExtenderServer {
    pub fn new(context: Arc<ExtenderContext>, listen_addr: String) -> Self {
        Self {
            context,
            listen_addr,
        }
    }

    /// Route table, separated from the listener so tests can drive it with
    /// `poem::test::TestClient`. The filter route only accepts POST; the
    /// router rejects other methods with an empty response.
    pub fn routes(context: Arc<ExtenderContext>) -> impl Endpoint {
        Route::new()
            .at("/", get(index))
            .at("/podspernode/filter", post(filter))
            .data(context)
    }

    /// Serve until cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting extender server on {}", self.listen_addr);

        let app = Self::routes(self.context).with(Tracing);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("Extender server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Extender server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = token.cancelled() => {
                info!("Extender server shutdown requested");
                Ok(())
            }
        }
    }
}
