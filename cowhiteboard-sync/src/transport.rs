//! One live socket to a room endpoint.
//!
//! A connection reports its lifecycle on a shared event channel, tagged with
//! the [`ConnectionId`] it was opened with:
//!
//! ```text
//! open() ──► Opened ──► Message* ──► Closed
//!    └──────────────────────────────► Closed   (handshake failed / closed early)
//! ```
//!
//! `Closed` is emitted exactly once per connection and does not distinguish
//! a graceful close from a failure. Frames that fail to decode are dropped
//! here and never reach the application.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ProtocolError, RoomId, ServerMessage};

/// Monotonic id assigned by the supervisor to every connection attempt.
pub type ConnectionId = u64;

/// Lifecycle notifications emitted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Message(ServerMessage),
    Closed,
}

pub type EventSender = mpsc::UnboundedSender<(ConnectionId, TransportEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(ConnectionId, TransportEvent)>;

/// Socket ready state, mirroring the browser WebSocket states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// A handle to one connection attempt.
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn ready_state(&self) -> ReadyState;

    fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Queue a frame. A no-op unless the connection is open.
    fn send(&self, frame: &ClientMessage);

    /// Release the socket. `Closed` is still reported on the event channel.
    fn close(&self);
}

/// Opens connections to rooms.
pub trait Connector: Send + 'static {
    type Conn: Connection;

    fn open(&self, room: &RoomId, id: ConnectionId, events: EventSender) -> Self::Conn;
}

/// Build the endpoint URL for a room: `{server_url}/ws/{room}`.
pub fn endpoint(server_url: &str, room: &RoomId) -> String {
    format!("{}/ws/{}", server_url.trim_end_matches('/'), room)
}

/// The connection currently considered live by a client.
///
/// Shared between the driver task, which installs and retires connections,
/// and the store listener, which sends through whatever is installed.
pub struct LiveConnection<K> {
    slot: Arc<Mutex<Option<K>>>,
}

impl<K> Clone for LiveConnection<K> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<K: Connection> Default for LiveConnection<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Connection> LiveConnection<K> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<K>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `conn`, returning the previous connection if any.
    pub fn replace(&self, conn: K) -> Option<K> {
        self.lock().replace(conn)
    }

    pub fn take(&self) -> Option<K> {
        self.lock().take()
    }

    /// Remove the installed connection only if it is `id`.
    pub fn take_if(&self, id: ConnectionId) -> Option<K> {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|c| c.id() == id) {
            slot.take()
        } else {
            None
        }
    }

    pub fn current_id(&self) -> Option<ConnectionId> {
        self.lock().as_ref().map(|c| c.id())
    }

    pub fn is_open(&self) -> bool {
        self.lock().as_ref().is_some_and(|c| c.is_open())
    }

    /// Send through the installed connection. Returns `false` (and sends
    /// nothing) when there is no open connection.
    pub fn send(&self, frame: &ClientMessage) -> bool {
        match self.lock().as_ref() {
            Some(conn) if conn.is_open() => {
                conn.send(frame);
                true
            }
            _ => {
                log::debug!("No open connection, dropping {} frame", frame.kind());
                false
            }
        }
    }
}

/// Opens WebSocket connections with `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    /// Spawns the socket task; must be called from inside a tokio runtime.
    fn open(&self, room: &RoomId, id: ConnectionId, events: EventSender) -> WsConnection {
        let url = endpoint(&self.server_url, room);
        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        log::debug!("Connection {id}: connecting to {url}");
        tokio::spawn(run_socket(url, id, state.clone(), outgoing_rx, events));

        WsConnection {
            id,
            state,
            outgoing: outgoing_tx,
        }
    }
}

enum Outgoing {
    Frame(String),
    Close,
}

/// Handle to a WebSocket owned by a background task.
///
/// Dropping the handle closes the socket.
pub struct WsConnection {
    id: ConnectionId,
    state: Arc<AtomicU8>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn send(&self, frame: &ClientMessage) {
        if !self.is_open() {
            log::debug!(
                "Connection {}: not open, dropping {} frame",
                self.id,
                frame.kind()
            );
            return;
        }
        match frame.encode() {
            Ok(text) => {
                let _ = self.outgoing.send(Outgoing::Frame(text));
            }
            Err(e) => log::warn!("Connection {}: failed to encode frame: {e}", self.id),
        }
    }

    fn close(&self) {
        let closing = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                match ReadyState::from_u8(raw) {
                    ReadyState::Connecting | ReadyState::Open => Some(ReadyState::Closing as u8),
                    _ => None,
                }
            })
            .is_ok();
        if closing {
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }
}

fn decode_frame(id: ConnectionId, decoded: Result<ServerMessage, ProtocolError>) -> Option<ServerMessage> {
    match decoded {
        Ok(msg) => Some(msg),
        Err(e) => {
            log::warn!("Connection {id}: dropping malformed frame: {e}");
            None
        }
    }
}

fn finish(id: ConnectionId, state: &AtomicU8, events: &EventSender) {
    state.store(ReadyState::Closed as u8, Ordering::SeqCst);
    let _ = events.send((id, TransportEvent::Closed));
}

async fn run_socket(
    url: String,
    id: ConnectionId,
    state: Arc<AtomicU8>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSender,
) {
    // Before the handshake completes the only possible command is a close
    // (sends are dropped while connecting).
    let connected = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
        _ = outgoing.recv() => {
            log::debug!("Connection {id}: closed before handshake completed");
            finish(id, &state, &events);
            return;
        }
    };

    let ws_stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            log::warn!("Connection {id}: failed to connect to {url}: {e}");
            finish(id, &state, &events);
            return;
        }
    };

    let opened = state
        .compare_exchange(
            ReadyState::Connecting as u8,
            ReadyState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok();
    let (mut writer, mut reader) = ws_stream.split();
    if !opened {
        let _ = writer.close().await;
        finish(id, &state, &events);
        return;
    }

    log::info!("Connection {id}: connected to {url}");
    let _ = events.send((id, TransportEvent::Opened));

    loop {
        tokio::select! {
            incoming = reader.next() => {
                let decoded = match incoming {
                    Some(Ok(Message::Text(text))) => ServerMessage::decode(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => ServerMessage::decode_bytes(&bytes),
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {id}: closed by server");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("Connection {id}: socket error: {e}");
                        break;
                    }
                };
                if let Some(msg) = decode_frame(id, decoded) {
                    let _ = events.send((id, TransportEvent::Message(msg)));
                }
            }
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(text)) => {
                    if let Err(e) = writer.send(Message::Text(text.into())).await {
                        log::warn!("Connection {id}: send failed: {e}");
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    log::debug!("Connection {id}: closing");
                    let _ = writer.close().await;
                    break;
                }
            }
        }
    }

    finish(id, &state, &events);
}
