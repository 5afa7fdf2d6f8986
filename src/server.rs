//! HTTP server and graceful shutdown.
//!
//! [`Server`] is the smallest host that can run a [`Handler`]: it accepts
//! TCP connections, speaks HTTP/1.1 or HTTP/2 (whatever the client
//! negotiates) with upgrades enabled so hooks can take connections over, and
//! hands every request to the handler.
//!
//! On **SIGTERM** or **Ctrl-C** the server:
//! 1. Immediately stops `listener.accept()` — no new connections are made.
//! 2. Lets every in-flight connection task run to completion.
//! 3. Returns from [`Server::serve`], which lets `main` exit cleanly.

use std::net::SocketAddr;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::context::AsContext;
use crate::error::Result;
use crate::handler::Handler;

/// The HTTP server.
#[derive(Debug)]
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// ```rust
    /// use mixer::Server;
    /// let server = Server::bind("0.0.0.0:3000").unwrap();
    /// # let _ = server;
    /// ```
    pub fn bind(addr: &str) -> Result<Self> {
        Ok(Self { addr: addr.parse()? })
    }

    /// Starts accepting connections and dispatching them to `handler`.
    ///
    /// Returns only after a full graceful shutdown.
    pub async fn serve<T: AsContext + 'static>(self, handler: Handler<T>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "mixer listening");

        let mut tasks = tokio::task::JoinSet::new();

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Check shutdown first so a SIGTERM stops accepting at once,
                // even if more connections are queued.
                biased;

                () = &mut shutdown => {
                    info!(
                        in_flight = tasks.len(),
                        "shutdown signal received, draining connections"
                    );
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let handler = handler.clone();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(io, handler)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("mixer stopped");
        Ok(())
    }
}

/// Resolves on the first shutdown signal the process receives.
///
/// SIGTERM and SIGINT on Unix, Ctrl-C elsewhere. A signal that cannot be
/// installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn bind_rejects_bad_addresses() {
        assert!(matches!(Server::bind("not an address"), Err(Error::InvalidAddr(_))));
        assert!(Server::bind("127.0.0.1:0").is_ok());
    }
}
