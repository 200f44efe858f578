//! The actual network plumbing behind GT: one-shot TCP connections,
//! dedup-by-envelope-id, and peer liveness bookkeeping. `GossipTransport`
//! owns the peer map and hands decoded, deduped envelopes to the caller
//! (the consensus coordinator) over a channel — it never interprets a
//! message's meaning itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use super::protocol::{Envelope, ProtocolError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(3);
const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);
const PRESENCE_INTERVAL: Duration = Duration::from_secs(5);
const PEER_EVICTION_AGE: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect/read timed out")]
    PeerUnreachable,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub node_id: String,
    pub ip: String,
    pub port: u16,
    pub last_seen: Instant,
}

/// Owns the peer directory and the envelope dedup cache. Cheap to clone
/// (wraps `Arc`); spawn `listen` and `run_maintenance` once per node.
#[derive(Clone)]
pub struct GossipTransport {
    node_id: String,
    listen_port: u16,
    peers: Arc<Mutex<HashMap<String, PeerHandle>>>,
    dedup: Arc<Mutex<HashMap<[u8; 32], Instant>>>,
    inbound: mpsc::Sender<(Envelope, String)>,
}

/// An envelope paired with the IP address it actually arrived from (as
/// opposed to `envelope.sender_port`, which is self-reported and only
/// trustworthy once combined with the observed connecting address).
pub type InboundEnvelope = (Envelope, String);

impl GossipTransport {
    pub fn new(node_id: String, listen_port: u16) -> (Self, mpsc::Receiver<InboundEnvelope>) {
        let (tx, rx) = mpsc::channel(1024);
        let transport = GossipTransport {
            node_id,
            listen_port,
            peers: Arc::new(Mutex::new(HashMap::new())),
            dedup: Arc::new(Mutex::new(HashMap::new())),
            inbound: tx,
        };
        (transport, rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn add_peer(&self, node_id: String, ip: String, port: u16) {
        let mut peers = self.peers.lock().await;
        peers.insert(node_id.clone(), PeerHandle { node_id, ip, port, last_seen: Instant::now() });
    }

    pub async fn touch_peer(&self, node_id: &str) {
        let mut peers = self.peers.lock().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.last_seen = Instant::now();
        }
    }

    pub async fn peers_snapshot(&self) -> Vec<PeerHandle> {
        self.peers.lock().await.values().cloned().collect()
    }

    /// Accepts inbound connections forever, spawning one short-lived task
    /// per connection. Each task reads until EOF, decodes one envelope,
    /// dedups it, relays it onward if `broadcast`, and forwards the first
    /// receipt to the inbound channel.
    pub async fn listen(self: Arc<Self>) -> Result<(), TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        loop {
            let (stream, addr) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = this.handle_connection(stream, addr.ip().to_string()).await {
                    eprintln!("gossip: inbound connection error: {err}");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer_ip: String) -> Result<(), TransportError> {
        let mut buf = Vec::new();
        let read = timeout(READ_TIMEOUT, stream.read_to_end(&mut buf)).await;
        match read {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::PeerUnreachable),
        }

        let envelope = Envelope::from_bytes(&buf)?;
        if !self.dedup_insert(envelope.id).await {
            return Ok(());
        }

        if matches!(envelope.msg_type, super::protocol::MessageType::Hello | super::protocol::MessageType::Presence)
            && envelope.sender != self.node_id
        {
            // Trust the observed connecting address over the self-reported
            // one; only the port comes from the envelope itself.
            self.add_peer(envelope.sender.clone(), peer_ip.clone(), envelope.sender_port).await;
        } else {
            self.touch_peer(&envelope.sender).await;
        }

        if envelope.broadcast {
            self.broadcast_excluding(&envelope, &envelope.sender.clone()).await;
        }

        // A full channel means the coordinator is backed up; dropping here
        // is preferable to blocking the accept loop.
        let _ = self.inbound.try_send((envelope, peer_ip));
        Ok(())
    }

    /// Opens a one-shot connection, writes the full envelope, and closes.
    /// Failures are swallowed by the caller's broadcast loop — an
    /// unreachable peer is skipped, not evicted (eviction is time-based).
    pub async fn send_to(&self, ip: &str, port: u16, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope.to_bytes()?;
        let connect = timeout(CONNECT_TIMEOUT, TcpStream::connect((ip, port))).await;
        let mut stream = match connect {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::PeerUnreachable),
        };
        stream.write_all(&bytes).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Sends to every known peer except `exclude_node_id` and this node's
    /// own id. Individual send failures are logged and skipped.
    pub async fn broadcast_excluding(&self, envelope: &Envelope, exclude_node_id: &str) {
        let targets: Vec<PeerHandle> = {
            let peers = self.peers.lock().await;
            peers
                .values()
                .filter(|p| p.node_id != exclude_node_id && p.node_id != self.node_id)
                .cloned()
                .collect()
        };
        for peer in targets {
            if let Err(err) = self.send_to(&peer.ip, peer.port, envelope).await {
                eprintln!("gossip: peer {} unreachable: {err}", peer.node_id);
            }
        }
    }

    pub async fn broadcast(&self, envelope: &Envelope) {
        self.broadcast_excluding(envelope, &self.node_id).await;
    }

    /// Returns `true` the first time this envelope id is seen within the
    /// TTL window; `false` on re-receipt.
    async fn dedup_insert(&self, id: [u8; 32]) -> bool {
        let mut dedup = self.dedup.lock().await;
        let now = Instant::now();
        match dedup.get(&id) {
            Some(seen_at) if now.duration_since(*seen_at) < DEDUP_TTL => false,
            _ => {
                dedup.insert(id, now);
                true
            }
        }
    }

    /// Periodic housekeeping: sweep stale dedup entries and evict peers
    /// that have produced no traffic in `PEER_EVICTION_AGE`. Intended to
    /// run as a long-lived background task alongside `listen`.
    pub async fn run_maintenance(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PRESENCE_INTERVAL);
        loop {
            ticker.tick().await;
            let now = Instant::now();

            let mut dedup = self.dedup.lock().await;
            dedup.retain(|_, seen_at| now.duration_since(*seen_at) < DEDUP_TTL);
            drop(dedup);

            let mut peers = self.peers.lock().await;
            peers.retain(|_, peer| now.duration_since(peer.last_seen) < PEER_EVICTION_AGE);
        }
    }

    /// Broadcasts a `PRESENCE` envelope every `PRESENCE_INTERVAL` so peers
    /// that haven't heard from us through consensus traffic don't evict us.
    /// Spawned as its own long-lived task, same as `run_maintenance`.
    pub async fn run_presence_broadcast(self: Arc<Self>) {
        use super::protocol::{hello_payload, Envelope, MessageType};
        use std::time::{SystemTime, UNIX_EPOCH};
        let mut ticker = tokio::time::interval(PRESENCE_INTERVAL);
        loop {
            ticker.tick().await;
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            let envelope = Envelope::new(
                MessageType::Presence,
                self.node_id.clone(),
                self.listen_port,
                hello_payload(&self.node_id, self.listen_port),
                now,
                true,
            );
            self.broadcast(&envelope).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{hello_payload, MessageType};

    #[tokio::test]
    async fn dedup_insert_is_true_only_on_first_receipt() {
        let (transport, _rx) = GossipTransport::new("node-a".to_string(), 0);
        let id = [7u8; 32];
        assert!(transport.dedup_insert(id).await);
        assert!(!transport.dedup_insert(id).await);
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_self() {
        let (transport, _rx) = GossipTransport::new("node-a".to_string(), 0);
        transport.add_peer("node-a".to_string(), "127.0.0.1".to_string(), 1).await;
        transport.add_peer("node-b".to_string(), "127.0.0.1".to_string(), 2).await;
        transport.add_peer("node-c".to_string(), "127.0.0.1".to_string(), 3).await;

        let envelope = Envelope::new(MessageType::Presence, "node-b", 2, hello_payload("node-b", 2), 0, true);
        // No listeners are actually running on these ports, so every send
        // fails; this only exercises the exclusion filter, not delivery.
        transport.broadcast_excluding(&envelope, "node-b").await;
    }

    #[tokio::test]
    async fn round_trip_over_loopback_delivers_envelope() {
        let (transport, mut rx) = GossipTransport::new("node-a".to_string(), 0);
        let transport = Arc::new(transport);

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::clone(&transport);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accepted.handle_connection(stream, "127.0.0.1".to_string()).await.unwrap();
        });

        let envelope = Envelope::new(MessageType::Ping, "node-b", 9000, hello_payload("node-b", 9000), 0, false);
        transport.send_to("127.0.0.1", port, &envelope).await.unwrap();

        let (received, ip) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.id, envelope.id);
        assert_eq!(ip, "127.0.0.1");
    }
}
