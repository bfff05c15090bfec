//! Inbound HTTP listener
//!
//! Accepts HTTP/1.1 connections, decodes each request body as an
//! [`Envelope`] and passes the payload to a [`MessageHandler`]. The status
//! code reflects decoding only:
//!
//! - `200 OK`: envelope decoded and handed to the handler
//! - `400 Bad Request`: body is not a valid envelope
//! - `500 Internal Server Error`: body could not be read

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::Envelope;

use super::MessageHandler;

/// How long [`ListenerHandle::stop`] waits for open connections to finish
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound, not yet serving, inbound listener
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind to `addr` (use port 0 for an OS-assigned port)
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr).await.map_err(|e| Error::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = inner.local_addr()?;

        Ok(Self { inner, local_addr })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// On shutdown the socket is closed first, then every open connection
    /// finishes its current request and is closed. Connections still busy
    /// after [`DRAIN_TIMEOUT`] are aborted.
    pub async fn serve(self, handler: Arc<dyn MessageHandler>, mut shutdown: watch::Receiver<bool>) {
        let Listener { inner, local_addr } = self;
        let mut connections = JoinSet::new();
        info!(addr = %local_addr, "Listener started");

        loop {
            tokio::select! {
                accepted = inner.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            connections.spawn(serve_connection(
                                stream,
                                remote,
                                handler.clone(),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(inner);

        let open = connections.len();
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(addr = %local_addr, open, "Connections did not drain in time, aborting");
            connections.shutdown().await;
        }

        info!(addr = %local_addr, "Listener stopped");
    }

    /// Serve on a background task
    pub fn spawn(self, handler: Arc<dyn MessageHandler>) -> ListenerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.serve(handler, shutdown_rx));

        ListenerHandle {
            local_addr,
            shutdown_tx,
            task,
        }
    }
}

/// Handle to a listener running on a background task
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections, close the open ones and wait for both.
    ///
    /// Once this returns no request reaches the handler any more.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Listener task ended abnormally");
        }
    }
}

/// Serve one connection until the peer closes it or the listener stops
async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(respond(handler.as_ref(), req).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(e) = result {
        debug!(remote = %remote, error = %e, "Connection closed with error");
    }
}

async fn respond(handler: &dyn MessageHandler, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match Envelope::from_json_bytes(&body) {
        Ok(envelope) => {
            debug!(
                id = envelope.id,
                sender = envelope.data.sender_id,
                kind = %envelope.data.kind,
                "Envelope received"
            );
            handler.handle(envelope.data).await;
            status(StatusCode::OK)
        }
        Err(e) => {
            warn!(error = %Error::Decode(e).format_for_log(), "Rejecting request");
            status(StatusCode::BAD_REQUEST)
        }
    }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = code;
    response
}
