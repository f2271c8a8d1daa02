//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::ratelimiter_server::RatelimiterServer;
use super::service::RatelimiterService;
use crate::error::{Result, SluiceError};
use crate::ratelimit::Limiter;
use crate::store::Store;

/// gRPC server for the rate limit service.
pub struct GrpcServer<S: Store> {
    /// Address to bind to
    addr: SocketAddr,
    /// The limiter answering queries
    limiter: Arc<Limiter<S>>,
}

impl<S: Store> GrpcServer<S> {
    /// Create a new gRPC server.
    pub fn new(addr: SocketAddr, limiter: Arc<Limiter<S>>) -> Self {
        Self { addr, limiter }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves. The
    /// limiter's decay tasks are left running; shut the limiter down after
    /// this returns.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = RatelimiterService::new(self.limiter);

        info!(
            addr = %self.addr,
            "Starting gRPC server for Ratelimiter"
        );

        Server::builder()
            .add_service(RatelimiterServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                SluiceError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let limiter = Arc::new(Limiter::new(Arc::new(MemoryStore::new())));
        let server = GrpcServer::new(addr, limiter);

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
