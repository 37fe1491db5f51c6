#![forbid(unsafe_code)]

// Channel-backed Connection mock and participant helpers shared by the
// room and signaling tests.

use crate::media::MediaConfig;
use crate::metrics::ServerMetrics;
use crate::room::roles::Role;
use crate::room::{Participant, Room};
use crate::signaling::connection::Connection;
use crate::signaling::protocol::{self, Message};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub struct MockConnection {
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    close_count: Arc<AtomicUsize>,
}

/// Test-side handle to a mock connection: feed frames to the server,
/// observe frames written by it.
pub struct MockRemote {
    to_server: mpsc::UnboundedSender<Vec<u8>>,
    from_server: mpsc::UnboundedReceiver<Vec<u8>>,
    close_count: Arc<AtomicUsize>,
}

impl MockRemote {
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Simulates the client's socket dying: the server's next read
    /// errors out. An empty frame is the reset marker.
    pub fn disconnect(&self) {
        let _ = self.to_server.send(Vec::new());
    }
}

impl MockConnection {
    pub fn pair() -> (Arc<MockConnection>, MockRemote) {
        let (to_server, inbound) = mpsc::unbounded_channel();
        let (outbound, from_server) = mpsc::unbounded_channel();
        let close_count = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(MockConnection {
                inbound: Mutex::new(inbound),
                outbound,
                close_count: Arc::clone(&close_count),
            }),
            MockRemote {
                to_server,
                from_server,
                close_count,
            },
        )
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.outbound
            .send(data.to_vec())
            .map_err(|_| anyhow!("mock connection closed"))
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            // Empty frame is the disconnect marker.
            Some(frame) if frame.is_empty() => Err(anyhow!("mock connection reset")),
            Some(frame) => Ok(frame),
            None => Err(anyhow!("mock connection closed")),
        }
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.inbound.lock().await.close();
    }
}

/// Builds a participant over a mock connection and adds it to the room.
/// No loops are started.
pub async fn make_participant(
    room: &Arc<Room>,
    id: &str,
    role: Role,
) -> (Arc<Participant>, MockRemote) {
    let (conn, remote) = MockConnection::pair();
    let participant = Participant::new(id, role, room.id.clone(), conn);
    room.add_participant(Arc::clone(&participant)).await.unwrap();
    (participant, remote)
}

/// Participant with a running write loop: messages enqueued by the room
/// appear on the remote side.
pub async fn spawn_participant(
    room: &Arc<Room>,
    id: &str,
    role: Role,
) -> (Arc<Participant>, MockRemote) {
    let (participant, remote) = make_participant(room, id, role).await;
    tokio::spawn(Arc::clone(&participant).write_loop(ServerMetrics::new()));
    (participant, remote)
}

/// Participant with both loops running, fed through the mock remote.
pub async fn spawn_full_participant(
    room: &Arc<Room>,
    id: &str,
    role: Role,
) -> (Arc<Participant>, MockRemote) {
    let (participant, remote) = spawn_participant(room, id, role).await;
    let media = Arc::new(MediaConfig { ice_servers: vec![] });
    tokio::spawn(Arc::clone(&participant).read_loop(
        Arc::clone(room),
        media,
        ServerMetrics::new(),
    ));
    (participant, remote)
}

pub fn send_frame(remote: &MockRemote, frame: &[u8]) {
    remote.to_server.send(frame.to_vec()).unwrap();
}

/// Receives and decodes the next server frame, panicking after 2 s.
pub async fn recv_message(remote: &mut MockRemote) -> Message {
    recv_message_within(remote, 2_000).await
}

pub async fn recv_message_within(remote: &mut MockRemote, millis: u64) -> Message {
    let frame = tokio::time::timeout(Duration::from_millis(millis), remote.from_server.recv())
        .await
        .expect("timed out waiting for server message")
        .expect("server side closed");
    protocol::decode(&frame).expect("server sent undecodable frame")
}

/// Asserts nothing arrives within a short grace window.
pub async fn assert_no_message(remote: &mut MockRemote) {
    let result =
        tokio::time::timeout(Duration::from_millis(150), remote.from_server.recv()).await;
    if let Ok(Some(frame)) = result {
        panic!(
            "unexpected message: {}",
            String::from_utf8_lossy(&frame)
        );
    }
}
