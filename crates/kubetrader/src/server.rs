//! Admin HTTP server: health endpoint over the discovery status.

use std::sync::Arc;

use poem::get;
use poem::handler;
use poem::listener::TcpListener;
use poem::web::Data;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use crate::discovery::DiscoveryStatus;

#[handler]
fn healthz(status: Data<&Arc<DiscoveryStatus>>) -> String {
    format!(
        "ok\nphase: {:?}\nlast_successful_discovery_ms: {}\n",
        status.phase(),
        status.last_success_ms()
    )
}

pub struct AdminServer {
    listen_addr: String,
    status: Arc<DiscoveryStatus>,
}

impl AdminServer {
    pub fn new(listen_addr: String, status: Arc<DiscoveryStatus>) -> Self {
        Self {
            listen_addr,
            status,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("starting admin server on {}", self.listen_addr);

        let app = Route::new()
            .at("/healthz", get(healthz))
            .data(self.status);
        let server = Server::new(TcpListener::bind(&self.listen_addr));

        tokio::select! {
            result = server.run(app) => {
                if let Err(e) = result {
                    error!("admin server failed: {e}");
                }
            }
            _ = cancel.cancelled() => {
                info!("admin server shutdown requested");
            }
        }
    }
}
