//! Integration tests against an in-process relay.
//!
//! The relay speaks the same JSON frames as the real server: it sends
//! `init` on join, forwards `update` frames to the other peers and
//! broadcasts `user_count` whenever someone joins or leaves.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cowhiteboard_sync::client::{SyncClient, SyncEvent};
use cowhiteboard_sync::config::ClientConfig;
use cowhiteboard_sync::protocol::{ClientMessage, RecordMap};
use cowhiteboard_sync::store::{DocumentStore, MemoryStore};
use cowhiteboard_sync::supervisor::ConnectionStatus;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const RETRY: Duration = Duration::from_millis(100);

#[derive(Default)]
struct RelayState {
    document: Mutex<RecordMap>,
    received: Mutex<Vec<ClientMessage>>,
    peers: AtomicUsize,
    accepted: AtomicUsize,
    next_peer: AtomicU64,
}

struct Relay {
    port: u16,
    state: Arc<RelayState>,
    kick: broadcast::Sender<()>,
}

impl Relay {
    fn document(&self) -> RecordMap {
        self.state.document.lock().unwrap().clone()
    }

    fn received(&self) -> Vec<ClientMessage> {
        self.state.received.lock().unwrap().clone()
    }

    fn peers(&self) -> usize {
        self.state.peers.load(Ordering::SeqCst)
    }

    fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Close every open socket from the server side.
    fn kick_all(&self) {
        let _ = self.kick.send(());
    }

    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay seeded with `document`.
async fn start_relay(document: RecordMap) -> Relay {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(RelayState::default());
    *state.document.lock().unwrap() = document;
    let (frames, _) = broadcast::channel(64);
    let (kick, _) = broadcast::channel(4);

    let relay = Relay {
        port,
        state: state.clone(),
        kick: kick.clone(),
    };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_peer(stream, state.clone(), frames.clone(), kick.clone()));
        }
    });
    relay
}

async fn serve_peer(
    stream: TcpStream,
    state: Arc<RelayState>,
    frames: broadcast::Sender<(u64, String)>,
    kick: broadcast::Sender<()>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let mut inbox = frames.subscribe();
    let mut kicked = kick.subscribe();

    // Peer ids start at 1; 0 marks relay-originated frames.
    let peer = state.next_peer.fetch_add(1, Ordering::SeqCst) + 1;
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let count = state.peers.fetch_add(1, Ordering::SeqCst) + 1;

    let snapshot = state.document.lock().unwrap().clone();
    let init = json!({"type": "init", "snapshot": snapshot, "userCount": count});
    if sink.send(Message::Text(init.to_string().into())).await.is_err() {
        state.peers.fetch_sub(1, Ordering::SeqCst);
        return;
    }
    let _ = frames.send((peer, json!({"type": "user_count", "count": count}).to_string()));

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(msg) = ClientMessage::decode(text.as_str()) else {
                        continue;
                    };
                    match &msg {
                        ClientMessage::Update { data, .. } => {
                            *state.document.lock().unwrap() = data.clone();
                            let _ = frames.send((peer, text.to_string()));
                        }
                        ClientMessage::Snapshot { data } => {
                            *state.document.lock().unwrap() = data.clone();
                        }
                    }
                    state.received.lock().unwrap().push(msg);
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            Ok((from, text)) = inbox.recv() => {
                let is_count = text.contains("\"user_count\"");
                if from != peer || is_count {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
            _ = kicked.recv() => {
                let _ = sink.close().await;
                break;
            }
        }
    }

    let count = state.peers.fetch_sub(1, Ordering::SeqCst) - 1;
    let _ = frames.send((0, json!({"type": "user_count", "count": count}).to_string()));
}

fn client_for(
    url: &str,
    room: &str,
) -> (SyncClient<MemoryStore>, Arc<Mutex<MemoryStore>>, mpsc::Receiver<SyncEvent>) {
    let store = Arc::new(Mutex::new(MemoryStore::new()));
    let config = ClientConfig::new(room)
        .with_server_url(url)
        .with_reconnect_delay(RETRY);
    let mut client = SyncClient::new(config, store.clone());
    let events = client.take_event_rx().unwrap();
    (client, store, events)
}

fn room() -> String {
    Uuid::new_v4().to_string()
}

fn shape(id: &str, x: i64) -> RecordMap {
    RecordMap::from([(id.to_string(), json!({"id": id, "typeName": "shape", "x": x}))])
}

/// Next status change, skipping presence events.
async fn next_status(events: &mut mpsc::Receiver<SyncEvent>) -> Option<ConnectionStatus> {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::StatusChanged(status))) => return Some(status),
            Ok(Some(SyncEvent::UserCount(_))) => continue,
            _ => return None,
        }
    }
}

/// Wait until a presence event with `count` arrives.
async fn wait_for_count(events: &mut mpsc::Receiver<SyncEvent>, count: u64) -> bool {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(SyncEvent::UserCount(n))) if n == count => return true,
            Ok(Some(_)) => continue,
            _ => return false,
        }
    }
}

/// Poll `cond` for up to two seconds.
async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn test_client_connects_and_receives_init() {
    let relay = start_relay(shape("shape:a", 1)).await;
    let (mut client, store, mut events) = client_for(&relay.url(), &room());

    assert_eq!(client.connection_status().await, ConnectionStatus::Disconnected);
    client.connect().unwrap();

    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));
    assert!(wait_until(|| store.lock().unwrap().contains("shape:a")).await);
    assert!(wait_for_count(&mut events, 1).await);
    assert_eq!(client.connection_status().await, ConnectionStatus::Connected);
    assert_eq!(client.user_count().await, Some(1));

    // Applying the init snapshot must not echo anything back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.received().is_empty());

    client.dispose().await;
}

#[tokio::test]
async fn test_local_edit_reaches_peer_without_echo() {
    let relay = start_relay(RecordMap::new()).await;
    let room = room();
    let (mut alice, alice_store, mut alice_events) = client_for(&relay.url(), &room);
    let (mut bob, bob_store, mut bob_events) = client_for(&relay.url(), &room);

    alice.connect().unwrap();
    assert_eq!(next_status(&mut alice_events).await, Some(ConnectionStatus::Connected));
    bob.connect().unwrap();
    assert_eq!(next_status(&mut bob_events).await, Some(ConnectionStatus::Connected));
    assert!(wait_until(|| relay.peers() == 2).await);

    alice_store.lock().unwrap().put(shape("shape:1", 10)).unwrap();

    assert!(wait_until(|| bob_store.lock().unwrap().contains("shape:1")).await);
    assert_eq!(
        bob_store.lock().unwrap().get("shape:1"),
        alice_store.lock().unwrap().get("shape:1")
    );

    // Bob applied a remote change; only Alice's original frame reached the relay.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let received = relay.received();
    assert_eq!(received.len(), 1);
    let ClientMessage::Update { changes, data } = &received[0] else {
        panic!("Expected update, got {:?}", received[0]);
    };
    assert!(changes.added.contains_key("shape:1"));
    assert_eq!(data.len(), 1);
    assert_eq!(relay.document(), shape("shape:1", 10));

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_session_records_stay_local() {
    let relay = start_relay(RecordMap::new()).await;
    let (mut client, store, mut events) = client_for(&relay.url(), &room());
    client.connect().unwrap();
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));

    store
        .lock()
        .unwrap()
        .put(RecordMap::from([(
            "camera:page1".to_string(),
            json!({"id": "camera:page1", "x": 0, "y": 0, "z": 1}),
        )]))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(relay.received().is_empty());

    client.dispose().await;
}

#[tokio::test]
async fn test_user_count_tracks_peers() {
    let relay = start_relay(RecordMap::new()).await;
    let room = room();
    let (mut alice, _, mut alice_events) = client_for(&relay.url(), &room);
    let (mut bob, _, _bob_events) = client_for(&relay.url(), &room);

    alice.connect().unwrap();
    assert!(wait_for_count(&mut alice_events, 1).await);

    bob.connect().unwrap();
    assert!(wait_for_count(&mut alice_events, 2).await);
    assert_eq!(alice.user_count().await, Some(2));

    bob.dispose().await;
    assert!(wait_for_count(&mut alice_events, 1).await);

    alice.dispose().await;
}

#[tokio::test]
async fn test_reconnect_after_server_close() {
    let relay = start_relay(shape("shape:a", 1)).await;
    let (mut client, _, mut events) = client_for(&relay.url(), &room());
    client.connect().unwrap();
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));
    assert!(wait_until(|| relay.peers() == 1).await);

    relay.kick_all();

    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Reconnecting));
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));
    assert_eq!(relay.accepted(), 2);
    assert!(client.is_open());

    client.dispose().await;
}

#[tokio::test]
async fn test_edits_after_reconnect_are_published() {
    let relay = start_relay(RecordMap::new()).await;
    let (mut client, store, mut events) = client_for(&relay.url(), &room());
    client.connect().unwrap();
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));
    assert!(wait_until(|| relay.peers() == 1).await);

    relay.kick_all();
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Reconnecting));
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));

    store.lock().unwrap().put(shape("shape:late", 3)).unwrap();
    assert!(wait_until(|| relay.document().contains_key("shape:late")).await);

    client.dispose().await;
}

#[tokio::test]
async fn test_unreachable_server_stays_disconnected() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut client, _, mut events) = client_for(&url, &room());
    client.connect().unwrap();

    // Several retry cycles, but the status never leaves disconnected.
    tokio::time::sleep(RETRY * 4).await;
    assert_eq!(client.connection_status().await, ConnectionStatus::Disconnected);
    assert!(events.try_recv().is_err());

    client.dispose().await;
}

#[tokio::test]
async fn test_dispose_during_retry_stops_reconnecting() {
    let relay = start_relay(RecordMap::new()).await;
    let (mut client, store, mut events) = client_for(&relay.url(), &room());
    client.connect().unwrap();
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));

    relay.kick_all();
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Reconnecting));
    client.dispose().await;

    tokio::time::sleep(RETRY * 4).await;
    assert_eq!(relay.accepted(), 1);
    assert_eq!(relay.peers(), 0);
    assert_eq!(store.lock().unwrap().listener_count(), 0);
}

#[tokio::test]
async fn test_dispose_closes_socket() {
    let relay = start_relay(RecordMap::new()).await;
    let (mut client, _, mut events) = client_for(&relay.url(), &room());
    client.connect().unwrap();
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));
    assert!(wait_until(|| relay.peers() == 1).await);

    client.dispose().await;
    assert!(wait_until(|| relay.peers() == 0).await);
}

#[tokio::test]
async fn test_save_snapshot_persists_document() {
    let relay = start_relay(RecordMap::new()).await;
    let (mut client, store, mut events) = client_for(&relay.url(), &room());
    store.lock().unwrap().put(shape("shape:1", 1)).unwrap();

    assert!(!client.save_snapshot());
    client.connect().unwrap();
    assert_eq!(next_status(&mut events).await, Some(ConnectionStatus::Connected));

    assert!(client.save_snapshot());
    assert!(wait_until(|| relay.document() == shape("shape:1", 1)).await);
    assert!(matches!(relay.received()[0], ClientMessage::Snapshot { .. }));

    client.dispose().await;
}
