//! Gossip Transport (GT): one-shot, CC-encoded envelopes over TCP, a
//! bounded dedup cache, and peer liveness tracking.

pub mod protocol;
pub mod transport;

pub use protocol::{Envelope, MessageType, ProtocolError};
pub use transport::{GossipTransport, PeerHandle};
