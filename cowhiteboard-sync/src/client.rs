//! The sync client: one per mounted board view.
//!
//! Provides:
//! - Connection lifecycle (mount, reconnect, dispose)
//! - Remote frame application with echo suppression
//! - Local edit publishing
//! - Status and presence reporting to the UI
//!
//! ```text
//!            ┌──────────────── driver task ────────────────┐
//!  relay ──► │ transport events ─► Supervisor ─► Directives │
//!            │        │                                    │
//!            │        └─► InboundHandler ─► store (remote) │
//!            └──────────────────────────────────────────────┘
//!  local edit ─► store ─► Publisher ─► LiveConnection ─► relay
//! ```

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use crate::config::{ClientConfig, ConfigError};
use crate::gate::EchoGate;
use crate::inbound::InboundHandler;
use crate::protocol::{ClientMessage, RoomId};
use crate::publisher::Publisher;
use crate::store::{DocumentStore, ListenerId};
use crate::supervisor::{
    Backoff, ConnectionStatus, Directive, FixedDelay, Supervisor,
};
use crate::transport::{
    ConnectionId, Connection, Connector, EventReceiver, EventSender, LiveConnection,
    TransportEvent, WsConnector,
};

/// Events buffered for the hosting UI before new ones are dropped.
/// The latest status and presence count stay queryable on the client.
pub const EVENT_CAPACITY: usize = 256;

/// Events emitted to the hosting UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection status changed.
    StatusChanged(ConnectionStatus),
    /// The relay reported a new number of users in the room.
    UserCount(u64),
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Client is already connected")]
    AlreadyConnected,
    #[error("Client has been disposed")]
    Disposed,
    #[error("No tokio runtime available")]
    NoRuntime,
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Keeps one document store in sync with one room.
pub struct SyncClient<S: DocumentStore, C: Connector = WsConnector> {
    /// Server URL, room and retry delay
    config: ClientConfig,
    /// The editor's record store, shared with the driver task
    store: Arc<Mutex<S>>,
    /// Raised while remote changes are being applied
    gate: EchoGate,
    /// Handed to the driver on connect.
    connector: Option<C>,
    /// Handed to the driver on connect.
    backoff: Option<Box<dyn Backoff>>,
    /// Connection the publisher sends through
    live: LiveConnection<C::Conn>,
    /// Last reported status
    status: Arc<RwLock<ConnectionStatus>>,
    /// Last reported presence count
    user_count: Arc<RwLock<Option<u64>>>,
    /// Event sender (to UI)
    event_tx: mpsc::Sender<SyncEvent>,
    /// Event receiver (for UI, taken once)
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    /// Publisher subscription on the store
    listener: Option<ListenerId>,
    /// Stops the driver task
    shutdown_tx: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
    disposed: bool,
}

impl<S: DocumentStore + 'static> SyncClient<S, WsConnector> {
    /// Client talking WebSocket to `config.server_url`.
    pub fn new(config: ClientConfig, store: Arc<Mutex<S>>) -> Self {
        let connector = WsConnector::new(config.server_url.clone());
        Self::with_connector(config, store, connector)
    }
}

impl<S: DocumentStore + 'static, C: Connector> SyncClient<S, C> {
    /// Client opening its connections through `connector`.
    pub fn with_connector(config: ClientConfig, store: Arc<Mutex<S>>, connector: C) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let backoff: Box<dyn Backoff> = Box::new(FixedDelay(config.reconnect_delay));
        Self {
            config,
            store,
            gate: EchoGate::new(),
            connector: Some(connector),
            backoff: Some(backoff),
            live: LiveConnection::new(),
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            user_count: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            listener: None,
            shutdown_tx: None,
            driver: None,
            disposed: false,
        }
    }

    /// Replace the reconnect delay policy. Only effective before `connect`.
    pub fn with_backoff(mut self, backoff: Box<dyn Backoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Mount: subscribe the publisher to the store and start the connection
    /// driver. Must be called from inside a tokio runtime.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        if self.disposed {
            return Err(ClientError::Disposed);
        }
        if self.driver.is_some() {
            return Err(ClientError::AlreadyConnected);
        }
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let (Some(connector), Some(backoff)) = (self.connector.take(), self.backoff.take()) else {
            return Err(ClientError::AlreadyConnected);
        };

        let publisher = Publisher::new(self.gate.clone(), self.live.clone());
        let listener = publisher.register(&mut *self.lock_store());
        self.listener = Some(listener);

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            room: self.config.room_id.clone(),
            connector,
            supervisor: Supervisor::new(backoff),
            live: self.live.clone(),
            inbound: InboundHandler::new(self.store.clone(), self.gate.clone()),
            status: self.status.clone(),
            user_count: self.user_count.clone(),
            event_tx: self.event_tx.clone(),
            transport_tx,
            transport_rx,
            retry: None,
        };

        log::info!("Joining room {} at {}", self.config.room_id, self.config.endpoint());
        self.shutdown_tx = Some(shutdown_tx);
        self.driver = Some(runtime.spawn(driver.run(shutdown_rx)));
        Ok(())
    }

    /// Ask the relay to persist the current document right away. Returns
    /// `false` when there is no open connection.
    pub fn save_snapshot(&self) -> bool {
        let data = self.lock_store().serialize();
        self.live.send(&ClientMessage::snapshot(data))
    }

    /// Current connection status.
    pub async fn connection_status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    /// Last presence count reported by the relay.
    pub async fn user_count(&self) -> Option<u64> {
        *self.user_count.read().await
    }

    /// Whether a connection is installed and open right now.
    pub fn is_open(&self) -> bool {
        self.live.is_open()
    }

    /// Get the room ID.
    pub fn room_id(&self) -> &RoomId {
        &self.config.room_id
    }

    /// Get the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared handle to the synced store.
    pub fn store(&self) -> Arc<Mutex<S>> {
        self.store.clone()
    }

    /// Unmount and wait for the driver to finish.
    pub async fn dispose(mut self) {
        self.teardown();
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                log::warn!("Sync driver for room {} ended abnormally: {e}", self.config.room_id);
            }
        }
    }
}

impl<S: DocumentStore, C: Connector> SyncClient<S, C> {
    fn lock_store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop the driver, close the socket and unsubscribe from the store.
    /// Each step runs regardless of the others.
    fn teardown(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        // Cancels any pending retry and closes the driver's connection.
        if let Some(shutdown) = self.shutdown_tx.take() {
            if shutdown.send(()).is_err() {
                log::debug!("Sync driver for room {} already stopped", self.config.room_id);
            }
        }

        if let Some(conn) = self.live.take() {
            conn.close();
        }

        if let Some(listener) = self.listener.take() {
            if !self.lock_store().unlisten(listener) {
                log::warn!("Store listener for room {} was already removed", self.config.room_id);
            }
        }

        log::info!("Left room {}", self.config.room_id);
    }
}

impl<S: DocumentStore, C: Connector> Drop for SyncClient<S, C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Owns the supervisor and executes its directives, one event at a time.
struct Driver<S, C: Connector> {
    room: RoomId,
    connector: C,
    supervisor: Supervisor,
    live: LiveConnection<C::Conn>,
    inbound: InboundHandler<S>,
    status: Arc<RwLock<ConnectionStatus>>,
    user_count: Arc<RwLock<Option<u64>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    transport_tx: EventSender,
    transport_rx: EventReceiver,
    /// The single retry timer slot.
    retry: Option<Pin<Box<Sleep>>>,
}

async fn retry_elapsed(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl<S: DocumentStore + 'static, C: Connector> Driver<S, C> {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let directives = self.supervisor.activate();
        self.execute(directives).await;

        loop {
            tokio::select! {
                biased;

                // Fires on explicit shutdown and when the client is dropped.
                _ = &mut shutdown => {
                    let directives = self.supervisor.dispose();
                    self.execute(directives).await;
                    break;
                }
                Some((id, event)) = self.transport_rx.recv() => {
                    self.on_transport(id, event).await;
                }
                _ = retry_elapsed(&mut self.retry) => {
                    self.retry = None;
                    let directives = self.supervisor.on_retry_elapsed();
                    self.execute(directives).await;
                }
            }
        }

        log::debug!("Sync driver for room {} stopped", self.room);
    }

    async fn on_transport(&mut self, id: ConnectionId, event: TransportEvent) {
        let directives = match event {
            TransportEvent::Opened => self.supervisor.on_opened(id),
            TransportEvent::Message(msg) => {
                if !self.supervisor.is_current(id) {
                    log::debug!("Dropping {} frame from stale connection {id}", msg.kind());
                    return;
                }
                let result = self.inbound.handle(msg);
                if let Some(count) = result.user_count {
                    *self.user_count.write().await = Some(count);
                    self.emit(SyncEvent::UserCount(count));
                }
                return;
            }
            TransportEvent::Closed => {
                self.live.take_if(id);
                self.supervisor.on_closed(id)
            }
        };
        self.execute(directives).await;
    }

    async fn execute(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Open(id) => {
                    let conn = self.connector.open(&self.room, id, self.transport_tx.clone());
                    if let Some(previous) = self.live.replace(conn) {
                        previous.close();
                    }
                }
                Directive::Close(id) => {
                    if let Some(conn) = self.live.take_if(id) {
                        conn.close();
                    }
                }
                Directive::ScheduleRetry(delay) => self.arm_retry(delay),
                Directive::CancelRetry => {
                    self.retry = None;
                }
                Directive::Report(status) => {
                    log::info!("Room {}: {status}", self.room);
                    *self.status.write().await = status;
                    self.emit(SyncEvent::StatusChanged(status));
                }
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::debug!("Event buffer for room {} full, dropping {event:?}", self.room);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn arm_retry(&mut self, delay: Duration) {
        if self.retry.is_some() {
            log::warn!("Retry already pending for room {}, keeping it", self.room);
            return;
        }
        self.retry = Some(Box::pin(tokio::time::sleep(delay)));
    }
}
