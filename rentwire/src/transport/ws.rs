//! WebSocket transport for `RentWire`.
//!
//! Implements [`Connector`]/[`Link`] over a WebSocket connection to the
//! messaging backend. Frames are JSON text messages (see
//! [`rentwire_proto::codec`]). The first frame after the socket opens is the
//! `authenticate` handshake; the backend answers with `authenticated` or
//! `connect_error`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use rentwire_proto::codec;
use rentwire_proto::event::ServerEvent;
use rentwire_proto::message::UserId;
use rentwire_proto::op::{ClientOp, Handshake};

use super::{Connector, Credential, Link, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the WebSocket (TCP + TLS + upgrade).
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(20);

/// Default timeout for the backend's handshake reply.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the inbound event channel between the reader task and the link.
const INBOUND_BUFFER: usize = 256;

/// Opens WebSocket links to a backend URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    open_timeout: Duration,
    auth_timeout: Duration,
}

impl WsConnector {
    /// Creates a connector for a `ws://` or `wss://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unreachable`] if the URL does not parse or
    /// uses another scheme.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::Unreachable(format!("invalid backend URL: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::Unreachable(format!(
                "unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        })
    }

    /// Overrides the socket-open timeout.
    #[must_use]
    pub const fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Overrides the handshake-reply timeout.
    #[must_use]
    pub const fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Returns the backend URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WsConnector {
    type Link = WsLink;

    /// Opens the socket, sends `authenticate`, waits for the reply, and
    /// spawns the background reader.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if opening or the handshake times out.
    /// - [`TransportError::Unreachable`] if the backend refuses the TCP connection.
    /// - [`TransportError::AuthRejected`] if the backend answers `connect_error`.
    /// - [`TransportError::Protocol`] for unexpected handshake frames.
    async fn connect(&self, credential: &Credential) -> Result<WsLink, TransportError> {
        let url = self.url.as_str();
        let (ws_stream, _response) = tokio::time::timeout(self.open_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "backend WebSocket open timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "backend WebSocket open failed");
                map_ws_connect_error(e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = codec::encode(&Handshake::Authenticate {
            token: credential.expose().to_string(),
        })?;
        ws_sender
            .send(Message::Text(hello.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send authenticate frame");
                TransportError::ConnectionClosed
            })?;

        let reply = tokio::time::timeout(self.auth_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url, "backend handshake reply timed out");
                TransportError::Timeout
            })?;

        let user_id = match reply {
            Some(Ok(Message::Text(text))) => match codec::decode::<ServerEvent>(&text)? {
                ServerEvent::Authenticated(session) => session.user_id,
                ServerEvent::ConnectError(payload) => {
                    tracing::warn!(reason = %payload.message, "backend rejected credential");
                    return Err(TransportError::AuthRejected(payload.message));
                }
                other => {
                    tracing::warn!(?other, "unexpected frame during handshake");
                    return Err(TransportError::Protocol(
                        "unexpected frame during handshake".into(),
                    ));
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                tracing::warn!("backend closed connection during handshake");
                return Err(TransportError::ConnectionClosed);
            }
            Some(Ok(_)) => {
                return Err(TransportError::Protocol(
                    "non-text frame during handshake".into(),
                ));
            }
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket error during handshake");
                return Err(TransportError::Io(std::io::Error::other(e)));
            }
        };

        tracing::info!(user_id = %user_id, url, "authenticated with backend");

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        Ok(WsLink {
            user_id,
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader,
        })
    }
}

/// An authenticated WebSocket session.
pub struct WsLink {
    user_id: UserId,
    ws_sender: Mutex<WsSender>,
    incoming: Mutex<mpsc::Receiver<ServerEvent>>,
    connected: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl WsLink {
    /// Whether the socket is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Link for WsLink {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn send(&self, op: &ClientOp) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        let text = codec::encode(op)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, op = %op, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            let mut sender = self.ws_sender.lock().await;
            let _ = sender.send(Message::Close(None)).await;
        }
        self.reader.abort();
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Background task decoding inbound frames into [`ServerEvent`]s.
///
/// Malformed frames are logged and skipped; the socket stays up. Clears
/// `connected` when the socket closes or errors.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match codec::decode::<ServerEvent>(&text) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        // Link dropped.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed backend frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("backend closed the WebSocket");
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "backend WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("backend reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Unreachable(format!(
            "backend HTTP error: status {}",
            response.status()
        )),
        other => TransportError::Io(std::io::Error::other(format!(
            "backend connection error: {other}"
        ))),
    }
}
