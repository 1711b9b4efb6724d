//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::SocketAddr;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::{
    Connection, ConnectionId, ConnectionLimits, Transport, TransportError,
};

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

/// Query parameter carrying the client's display name.
const NAME_PARAM: &str = "name";

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
    limits: ConnectionLimits,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address with default
    /// connection limits.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        Self::bind_with(addr, ConnectionLimits::default()).await
    }

    /// Binds a new WebSocket transport applying `limits` to every
    /// accepted connection.
    pub async fn bind_with(
        addr: &str,
        limits: ConnectionLimits,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self { listener, limits })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let mut display_name: Option<String> = None;
        let callback = |req: &Request, resp: Response| {
            match name_from_query(req.uri().query()) {
                Some(name) => {
                    display_name = Some(name);
                    Ok(resp)
                }
                None => {
                    let mut refusal: ErrorResponse = ErrorResponse::new(Some(
                        format!("missing query parameter '{NAME_PARAM}'"),
                    ));
                    *refusal.status_mut() = StatusCode::BAD_REQUEST;
                    Err(refusal)
                }
            }
        };

        // The reader refuses an oversized frame from its header.
        let config = WebSocketConfig::default()
            .max_message_size(Some(self.limits.max_message_size))
            .max_frame_size(Some(self.limits.max_message_size));
        let upgrade =
            tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config))
                .await;
        let (ws, name) = match (upgrade, display_name) {
            (Ok(ws), Some(name)) => (ws, name),
            // The callback only accepts after recording a name.
            (_, None) => {
                tracing::debug!(%addr, "refused upgrade without display name");
                return Err(TransportError::Rejected(format!(
                    "{addr}: missing display name"
                )));
            }
            (Err(e), Some(_)) => {
                return Err(TransportError::AcceptFailed(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    e,
                )));
            }
        };

        let id = ConnectionId::new();
        tracing::debug!(%id, %addr, name = %name, "accepted WebSocket connection");

        let (sink, stream) = ws.split();
        Ok(WebSocketConnection {
            id,
            name,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            limits: self.limits,
        })
    }
}

/// Extracts a non-empty display name from a raw query string.
fn name_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == NAME_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|name| !name.is_empty())
}

/// A single WebSocket connection.
///
/// The socket is split so the receive loop and the send loop never wait
/// on each other's lock.
pub struct WebSocketConnection {
    id: ConnectionId,
    name: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    limits: ConnectionLimits,
}

impl WebSocketConnection {
    async fn write(&self, msg: Message) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        tokio::time::timeout(self.limits.write_timeout, sink.send(msg))
            .await
            .map_err(|_| TransportError::DeadlineExceeded("write"))?
            .map_err(|e| {
                TransportError::SendFailed(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    e,
                ))
            })
    }

    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.limits.max_message_size {
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.limits.max_message_size,
            });
        }
        Ok(())
    }
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        let msg = match std::str::from_utf8(data) {
            Ok(text) => Message::text(text.to_owned()),
            Err(_) => Message::Binary(data.to_vec().into()),
        };
        self.write(msg).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut stream = self.stream.lock().await;
        loop {
            // Each frame, pongs included, gets a fresh deadline.
            let msg = tokio::time::timeout(self.limits.read_timeout, stream.next())
                .await
                .map_err(|_| TransportError::DeadlineExceeded("read"))?;
            match msg {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Some(data.into()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/frame
                Some(Err(WsError::Capacity(CapacityError::MessageTooLong {
                    size,
                    max_size,
                }))) => {
                    return Err(TransportError::FrameTooLarge {
                        size,
                        limit: max_size,
                    });
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(
                        std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            e,
                        ),
                    ));
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), Self::Error> {
        self.write(Message::Ping(Vec::new().into())).await
    }

    async fn close(&self) -> Result<(), Self::Error> {
        let mut sink = self.sink.lock().await;
        sink.close().await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}
