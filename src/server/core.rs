use axum::Extension;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use log::{debug, error, info, warn};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::sleep_until;

use crate::config::ServerConfig;
use crate::http::{self, Peer, ReplyDeadline};
use crate::server::context::ServerContext;

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Opens the filesystem root and binds the listener.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let socket = config.listen_socket();
        let ctx = ServerContext::new(config).map_err(|e| io::Error::other(e.to_string()))?;

        let listener = match TcpListener::bind(&socket).await {
            Ok(listener) => {
                info!("Server bound to {}", socket);
                listener
            }
            Err(e) => {
                error!("Failed to bind to {}: {}", socket, e);
                return Err(e);
            }
        };

        if ctx.authenticator().is_none() {
            warn!("No shared secret configured; connections are not authenticated");
        }

        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Accept loop; every connection runs in its own task.
    pub async fn start(&self) {
        info!(
            "Starting byfs server on {} serving {}",
            self.ctx.config().listen_socket(),
            self.ctx.fs().root().display()
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let ctx = Arc::clone(&self.ctx);
                    info!("Accepted connection from {}", addr);

                    // Spawn a task for each client so accept loop doesn't block
                    tokio::spawn(async move {
                        serve_stream(stream, &addr.to_string(), ctx).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

/// hyper rejects a smaller read buffer.
const MIN_READ_BUFFER: usize = 8 * 1024;

/// Serves one accepted transport: one HTTP exchange, which may end in a
/// handoff to the stream protocol. The request head must arrive within the
/// action deadline and the reply is bounded by `ReplyDeadline`.
pub async fn serve_stream<S>(stream: S, peer: &str, ctx: Arc<ServerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = ctx.config();
    let deadline = ReplyDeadline::new(config.idle_timeout(), config.action_timeout());
    let app = http::router(Arc::clone(&ctx))
        .layer(Extension(Peer(peer.to_string())))
        .layer(Extension(deadline.clone()));

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(config.action_timeout())
        .max_buf_size(config.max_header_bytes.max(MIN_READ_BUFFER));
    let conn = builder
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(app))
        .with_upgrades();
    tokio::pin!(conn);

    loop {
        let at = deadline.at();
        tokio::select! {
            served = &mut conn => {
                match served {
                    Ok(()) => debug!("Finished HTTP exchange with {}", peer),
                    Err(e) if e.is_timeout() => warn!("Timed out waiting for request from {}", peer),
                    Err(e) => warn!("Failed to handle client {}: {}", peer, e),
                }
                return;
            }
            _ = sleep_until(at) => {
                if deadline.expired() {
                    warn!("Timed out serving {}", peer);
                    return;
                }
            }
            _ = deadline.moved() => {}
        }
    }
}
