//! TCP/TLS accept loop.
//!
//! Each accepted connection reads the *current* TLS configuration once and
//! keeps it for its whole lifetime, so a certificate reload only affects
//! connections accepted afterwards.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in this module
//! - Accept and handshake errors are logged and the loop continues

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{router, AppState};
use crate::certs::ActiveCertificate;

/// Limit for completing a TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long open connections get to finish after shutdown is requested.
const CONNECTION_DRAIN: Duration = Duration::from_secs(1);

/// Errors that can occur in the gateway server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS is enabled but no certificate is loaded")]
    NoCertificate,
}

/// The HTTPS (or plain HTTP) server in front of the router.
pub struct GatewayServer {
    listener: TcpListener,
    router: Router,
    /// `None` serves plain HTTP
    tls: Option<watch::Receiver<Option<Arc<ActiveCertificate>>>>,
    cancel_token: CancellationToken,
}

impl GatewayServer {
    /// Binds `addr` and prepares to serve `state`.
    ///
    /// # Errors
    ///
    /// `ServerError::Bind` if the address is unavailable,
    /// `ServerError::NoCertificate` if TLS is requested before `ensure`.
    pub async fn bind(
        addr: SocketAddr,
        state: AppState,
        tls: bool,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Self::from_listener(listener, state, tls, cancel_token)
    }

    /// Serves on an already bound listener.
    ///
    /// # Errors
    ///
    /// `ServerError::NoCertificate` if TLS is requested before `ensure`.
    pub fn from_listener(
        listener: TcpListener,
        state: AppState,
        tls: bool,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let tls = if tls {
            if state.certs.current().is_none() {
                return Err(ServerError::NoCertificate);
            }
            Some(state.certs.subscribe())
        } else {
            None
        };

        Ok(Self {
            listener,
            router: router(state),
            tls,
            cancel_token,
        })
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok(())`; accept errors are logged.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            addr = ?self.listener.local_addr().ok(),
            tls = self.tls.is_some(),
            "Gateway listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Gateway shutdown requested");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.handle_connection(stream, peer),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let router = self.router.clone();
        let cancel = self.cancel_token.clone();

        let acceptor = match &self.tls {
            None => None,
            Some(rx) => {
                let current = rx.borrow().clone();
                match current {
                    Some(active) => Some(TlsAcceptor::from(Arc::clone(&active.server_config))),
                    None => {
                        warn!(peer = %peer, "Dropping connection, no certificate loaded");
                        return;
                    }
                }
            }
        };

        tokio::spawn(async move {
            match acceptor {
                None => serve_connection(stream, router, peer, cancel).await,
                Some(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => serve_connection(tls, router, peer, cancel).await,
                    Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                    Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
                },
            }
        });
    }
}

/// Serves HTTP/1.1 or HTTP/2 on one connection.
async fn serve_connection<S>(io: S, router: Router, peer: SocketAddr, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let builder = Builder::new(TokioExecutor::new());
    let connection =
        builder.serve_connection_with_upgrades(TokioIo::new(io), TowerToHyperService::new(router));
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection closed with error");
            }
        }
        _ = cancel.cancelled() => {
            connection.as_mut().graceful_shutdown();
            // Event streams never finish on their own
            if timeout(CONNECTION_DRAIN, connection.as_mut()).await.is_err() {
                debug!(peer = %peer, "Dropping connection at shutdown");
            }
        }
    }
}
