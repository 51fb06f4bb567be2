//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and runs each HTTP/1.1 request through a
//! middleware [`Pipeline`]. Supports persistent connections (keep-alive) and
//! graceful shutdown through a [`CancellationToken`].

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::Pipeline;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP server hosting a middleware pipeline.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use corral::cache::{CacheConfig, CacheMiddleware, MemoryStore};
/// use corral::middleware::{LoggerMiddleware, Pipeline};
/// use corral::server::Server;
/// use corral::{Response, StatusCode};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = Pipeline::new()
///         .with(LoggerMiddleware)
///         .with(CacheMiddleware::new(CacheConfig::default(), Arc::new(MemoryStore::new())))
///         .endpoint(|_ctx| async { Response::new(StatusCode::Ok).body("<rss/>") });
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(pipeline, CancellationToken::new()).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and runs every request through `pipeline` until
    /// `shutdown` is cancelled.
    ///
    /// Each request's [`Context`] carries a child of `shutdown`, so stages
    /// that suspend (such as a cache follower) stop waiting on shutdown.
    /// The same token is cancelled if the peer closes its end while the
    /// request is in flight; a client that half-closes after sending is
    /// treated as gone. Open connections close after their current response.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(
        self,
        pipeline: Pipeline,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let pipeline = Arc::new(pipeline);
        info!(address = %self.local_addr, "corral listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(address = %self.local_addr, "shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let pipeline = Arc::clone(&pipeline);
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, pipeline, shutdown).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, serving every
/// complete request in the buffer before reading again, until the peer closes
/// the connection, signals `Connection: close`, or shutdown is requested.
/// An idle connection is dropped as soon as `shutdown` fires.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut need_read = true;

    loop {
        if need_read {
            let bytes_read = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(peer = %peer_addr, "closing idle connection on shutdown");
                    break;
                }
                read = stream.read_buf(&mut buf) => read?,
            };
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large — sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                need_read = true;
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            need_read = true;
            continue;
        }

        let keep_alive = request.is_keep_alive() && !shutdown.is_cancelled();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        // Cancelled on shutdown or when the peer hangs up mid-request, so a
        // waiting follower stops polling for a client that is gone.
        let request_token = shutdown.child_token();
        let ctx = Context::with_cancellation(request, request_token.clone());
        let handling = pipeline.handle(ctx);
        tokio::pin!(handling);

        let mut peer_gone = false;
        let mut response = loop {
            tokio::select! {
                biased;
                response = &mut handling => break response,
                read = stream.read_buf(&mut buf), if !peer_gone => {
                    // Bytes that do arrive are a pipelined follow-up; keep them.
                    if matches!(read, Ok(0) | Err(_)) {
                        debug!(peer = %peer_addr, "peer disconnected mid-request");
                        peer_gone = true;
                        request_token.cancel();
                    }
                }
            }
        };
        if peer_gone {
            break;
        }
        if !keep_alive {
            response = response.keep_alive(false);
        }
        let close = !response.is_keep_alive();
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request; a pipelined follow-up may already be buffered.
        let _ = buf.split_to(total_needed);
        need_read = buf.is_empty();

        if close || shutdown.is_cancelled() {
            debug!(peer = %peer_addr, "closing connection");
            break;
        }
    }

    Ok(())
}
