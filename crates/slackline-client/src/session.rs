//! Persistent socket sessions established against a handshake endpoint.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use slackline_core::{ConnectError, Logger, WriteHandle};

use crate::resolver::Resolver;
use crate::scheduler::SchedulerHandle;

/// An established session.
///
/// The socket itself lives in a pump task on the scheduler; this value keeps
/// the handles to talk to it. Dropping the session closes the socket.
pub struct Session {
    endpoint: String,
    writer: WriteHandle,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl Session {
    /// Wrap a pump that watches `shutdown` and cancels `closed` on exit.
    pub fn new(
        endpoint: impl Into<String>,
        writer: WriteHandle,
        shutdown: CancellationToken,
        closed: CancellationToken,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            writer,
            shutdown,
            closed,
        }
    }

    /// A session with no socket behind it; closing it is immediate.
    pub fn detached(endpoint: impl Into<String>) -> Self {
        let (writer, _rx) = WriteHandle::channel();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        Self::new(endpoint, writer, shutdown.clone(), shutdown)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn writer(&self) -> WriteHandle {
        self.writer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Ask the pump to send a close frame and stop.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the pump has exited.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builds a [`Session`] for a handshake endpoint.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(
        &self,
        endpoint: &str,
        scheduler: &SchedulerHandle,
        logger: Arc<dyn Logger>,
        cancel: &CancellationToken,
    ) -> Result<Session, ConnectError>;
}

/// WebSocket sessions over tokio-tungstenite, dialed through a [`Resolver`].
pub struct WebSocketSessionFactory {
    resolver: Arc<dyn Resolver>,
}

impl WebSocketSessionFactory {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    async fn dial(&self, endpoint: &str) -> Result<TcpStream, ConnectError> {
        let url = Url::parse(endpoint).map_err(|e| {
            ConnectError::SessionEstablishmentFailed(format!("invalid endpoint `{endpoint}`: {e}"))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConnectError::SessionEstablishmentFailed(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }
        let host = url.host_str().ok_or_else(|| {
            ConnectError::SessionEstablishmentFailed(format!("endpoint `{endpoint}` has no host"))
        })?;
        let port = url.port_or_known_default().unwrap_or(443);

        let addrs = self
            .resolver
            .resolve(host)
            .await
            .map_err(|e| ConnectError::session(&e))?;

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses resolved");
        for ip in addrs {
            match TcpStream::connect(SocketAddr::new(ip, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%ip, port, error = %e, "tcp connect failed");
                    last_err = e;
                }
            }
        }
        Err(ConnectError::session(&last_err))
    }
}

#[async_trait]
impl SessionFactory for WebSocketSessionFactory {
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    async fn create_session(
        &self,
        endpoint: &str,
        scheduler: &SchedulerHandle,
        logger: Arc<dyn Logger>,
        cancel: &CancellationToken,
    ) -> Result<Session, ConnectError> {
        let connect = async {
            let stream = self.dial(endpoint).await?;
            let (ws, _response) = tokio_tungstenite::client_async_tls(endpoint, stream)
                .await
                .map_err(|e| ConnectError::session(&e))?;
            Ok::<_, ConnectError>(ws)
        };
        let ws = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            ws = connect => ws?,
        };

        let (writer, outbound) = WriteHandle::channel();
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        scheduler.spawn(pump(
            ws,
            outbound,
            shutdown.clone(),
            closed.clone(),
            logger,
        ));
        debug!(endpoint, "session established");
        Ok(Session::new(endpoint, writer, shutdown, closed))
    }
}

/// Moves frames between the socket and the session's handles until either
/// side stops.
async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: UnboundedReceiver<String>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    logger: Arc<dyn Logger>,
) {
    let _closed = closed.drop_guard();
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    logger.debug(&format!("frame received: {}", text.as_str()));
                }
                Some(Ok(Message::Binary(data))) => {
                    logger.debug(&format!("binary frame received ({} bytes)", data.len()));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "session read failed");
                    break;
                }
            },
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::text(text)).await {
                    warn!(error = %e, "session write failed");
                    break;
                }
            }
        }
    }
    debug!("session pump stopped");
}
