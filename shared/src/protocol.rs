//! Datagram envelope carried over UDP between players, fronts, quorum,
//! and store. Every message is a tagged variant serialized with bincode;
//! reliable delivery (sequencing, acks, resends) lives in
//! [`crate::channel`] on top of these.

use crate::world::{Object, ObjectId, SectionId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Receive-buffer size; no datagram in the protocol approaches this.
pub const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Datagram {
    /// Front→player keepalive carrying the front's current RTT estimate
    /// and a timestamp the player echoes back.
    Ping { rtt_ms: u64, timestamp_ms: u64 },
    /// Player→front keepalive reply echoing the ping timestamp.
    Pong { timestamp_ms: u64 },
    /// Cumulative acknowledgement for a player↔front link.
    Ack { ack: u64 },
    /// Section mutation pushed front→player; `None` object is a removal.
    Update {
        version: u64,
        object_id: ObjectId,
        object: Option<Object>,
    },
    /// Sequenced gameplay command, player→front.
    Command { sequence: u64, command: Command },
    /// Player ends the session.
    Quit,
    /// "You are talking to the wrong front" — sender unknown here.
    WrongFront,
    /// Redirect the player's messaging to another front.
    Redirect { front: SocketAddr },
    /// Section mutation pushed front→store.
    StoreUpdate {
        section: SectionId,
        version: u64,
        object_id: ObjectId,
        object: Option<Object>,
    },
    /// Store's cumulative acknowledgement for one section's stream.
    StoreAck { section: SectionId, version: u64 },
    /// Quorum→front liveness probe.
    HeartbeatPing,
    /// Front→quorum liveness reply.
    HeartbeatPong,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Nop,
    SetSpeed(i16),
    SetDirection(i16),
}

pub fn decode(buf: &[u8]) -> Result<Datagram, bincode::Error> {
    bincode::deserialize(buf)
}

/// Serializes and sends a datagram, dropping it with probability
/// `loss_pct` percent to exercise retransmission in tests and demos.
pub async fn send_datagram(
    socket: &UdpSocket,
    datagram: &Datagram,
    addr: SocketAddr,
    loss_pct: u8,
) -> io::Result<()> {
    let data = bincode::serialize(datagram)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    send_raw(socket, &data, addr, loss_pct).await
}

/// Sends already-serialized datagram bytes with the same loss switch;
/// used by resend paths that retain wire bytes.
pub async fn send_raw(
    socket: &UdpSocket,
    data: &[u8],
    addr: SocketAddr,
    loss_pct: u8,
) -> io::Result<()> {
    if loss_pct > 0 && rand::thread_rng().gen_range(1..=100) <= u32::from(loss_pct) {
        return Ok(());
    }
    socket.send_to(data, addr).await?;
    Ok(())
}
