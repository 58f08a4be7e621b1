/*!
 * @file server.rs
 * @brief Wire listeners and the accept loop
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::command_processor::ServerContext;
use crate::connection::handle_connection;
use crate::error::Result;
use crate::shutdown::ShutdownManager;
use crate::ssl;

pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    unix_listener: Option<UnixListener>,
    tls_acceptor: Option<TlsAcceptor>,
    connection_ids: AtomicU64,
}

impl Server {
    /// Binds every configured listener. Bind failures are fatal and happen
    /// before the process reports readiness.
    pub async fn bind(ctx: Arc<ServerContext>) -> Result<Self> {
        let listener = TcpListener::bind(&ctx.config.listen.addr).await?;
        info!(addr = %listener.local_addr()?, "wire listener bound");

        let tls_acceptor = if ctx.config.listen.tls {
            let cert = ctx.config.listen.tls_cert_file.as_deref().unwrap_or_default();
            let key = ctx.config.listen.tls_key_file.as_deref().unwrap_or_default();
            let config =
                ssl::load_server_config(cert, key, ctx.config.listen.tls_ca_file.as_deref())?;
            info!("TLS enabled on the TCP listener");
            Some(TlsAcceptor::from(Arc::new(config)))
        } else {
            None
        };

        let unix_listener = match &ctx.config.listen.unix {
            Some(path) => {
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                info!(path = %path, "unix listener bound");
                Some(listener)
            }
            None => None,
        };

        Ok(Self {
            ctx,
            listener,
            unix_listener,
            tls_acceptor,
            connection_ids: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until shutdown. Each connection runs on its own task; a
    /// shutdown broadcast stops the accept loop immediately and lets the
    /// handlers finish their in-flight command.
    pub async fn run(self, shutdown: &ShutdownManager) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("listener stopped accepting connections");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let id = self.connection_ids.fetch_add(1, Ordering::Relaxed);
                            let ctx = self.ctx.clone();
                            let rx = shutdown.subscribe();
                            let acceptor = self.tls_acceptor.clone();
                            tokio::spawn(async move {
                                match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            handle_connection(ctx, tls_stream, peer.to_string(), id, rx)
                                                .await
                                        }
                                        Err(e) => {
                                            warn!(peer = %peer, error = %e, "TLS handshake failed")
                                        }
                                    },
                                    None => {
                                        handle_connection(ctx, stream, peer.to_string(), id, rx).await
                                    }
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
                accepted = accept_unix(self.unix_listener.as_ref()) => {
                    match accepted {
                        Ok(stream) => {
                            let id = self.connection_ids.fetch_add(1, Ordering::Relaxed);
                            let ctx = self.ctx.clone();
                            let rx = shutdown.subscribe();
                            tokio::spawn(async move {
                                handle_connection(ctx, stream, "unix".to_string(), id, rx).await
                            });
                        }
                        Err(e) => warn!(error = %e, "failed to accept unix connection"),
                    }
                }
            }
        }
    }
}

async fn accept_unix(listener: Option<&UnixListener>) -> std::io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}
