use std::net::SocketAddr;

use anyhow::Result;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::{config::ProxyConfig, service::ProxyService};

/// HTTP server that accepts connections and hands them to the proxy service.
///
/// This struct owns the TCP listener and the service that every accepted
/// connection is served with.
pub struct Server {
    /// The TCP listener for accepting incoming connections
    connection: TcpListener,
    /// The service cloned into every connection
    service: ProxyService,
}

impl Server {
    /// Creates a new server instance bound to the specified address.
    ///
    /// # Arguments
    ///
    /// * `addr` - The network address to bind to, port `0` picks a free port
    /// * `service` - The service handling every request
    ///
    /// # Returns
    ///
    /// Returns a `Result<Server>` containing the new server instance or an error.
    pub async fn new(addr: SocketAddr, service: ProxyService) -> Result<Self> {
        Ok(Self {
            connection: TcpListener::bind(&addr).await?,
            service,
        })
    }

    /// Builds the service from `config` and binds its `listen` address.
    pub async fn from_config(config: &ProxyConfig) -> Result<Self> {
        let service = ProxyService::from_config(config)?;
        Self::new(config.server.listen, service).await
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.connection.local_addr()?)
    }

    /// Accepts a new connection and spawns a task to handle it.
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` when a connection is accepted and its task spawned,
    /// or an error if accepting fails.
    pub async fn accept(&self) -> Result<()> {
        let (conn, address) = self.connection.accept().await?;
        debug!("Accepted connection from {}", address);

        let mut service = self.service.clone();
        service.from = address;

        let io = TokioIo::new(conn);
        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!("Error serving connection from {}: {:?}", address, e);
            }
        });
        Ok(())
    }

    /// Accepts connections until the process exits.
    pub async fn run(&self) {
        loop {
            if let Err(e) = self.accept().await {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
