//! Player connection management: per-player link state (keepalive
//! counters, RTT estimate, reliable channels) and the table the front
//! uses to route datagrams back to players.

use log::info;
use shared::channel::{RecvChannel, RttEstimate, SendChannel};
use shared::protocol::Command;
use shared::world::{PlayerId, PlayerRecord};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// One connected player. The update channel is created when the player
/// fetches their section feed; commands arrive on a channel of their
/// own. Both are reset whenever the player changes section or front,
/// since a new section implies a fresh sequence space.
pub struct PlayerLink {
    pub record: PlayerRecord,
    pub addr: SocketAddr,
    /// Keepalives sent since the last reply.
    pub missed_pings: u32,
    pub rtt: RttEstimate,
    /// Outbound updates keyed by section version; `None` until the
    /// player has fetched a snapshot to anchor the sequence space.
    pub updates: Option<SendChannel<Vec<u8>>>,
    /// Inbound gameplay commands, applied in sequence order.
    pub commands: RecvChannel<Command>,
}

impl PlayerLink {
    pub fn new(record: PlayerRecord, addr: SocketAddr, initial_rtt: Duration) -> Self {
        Self {
            record,
            addr,
            missed_pings: 0,
            rtt: RttEstimate::new(initial_rtt),
            updates: None,
            commands: RecvChannel::new(),
        }
    }

    /// Fresh channel state after a section or front change.
    pub fn reset_link(&mut self, initial_rtt: Duration) {
        self.missed_pings = 0;
        self.rtt = RttEstimate::new(initial_rtt);
        self.updates = None;
        self.commands = RecvChannel::new();
    }
}

/// All players currently attached to this front.
#[derive(Default)]
pub struct PlayerTable {
    players: HashMap<PlayerId, PlayerLink>,
}

impl PlayerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts a player record handed over by quorum or by another front.
    /// Replaces any existing link for the same id with fresh channel
    /// state. Returns false when the record carries no datagram address.
    pub fn attach(&mut self, record: PlayerRecord, initial_rtt: Duration) -> bool {
        let Some(addr) = record.addr else {
            return false;
        };
        info!("player {} ({}) attached from {}", record.id, record.name, addr);
        let id = record.id;
        self.players
            .insert(id, PlayerLink::new(record, addr, initial_rtt));
        true
    }

    pub fn remove(&mut self, id: PlayerId) -> Option<PlayerLink> {
        let link = self.players.remove(&id);
        if link.is_some() {
            info!("player {} detached", id);
        }
        link
    }

    pub fn get(&self, id: PlayerId) -> Option<&PlayerLink> {
        self.players.get(&id)
    }

    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut PlayerLink> {
        self.players.get_mut(&id)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PlayerId> {
        self.players
            .iter()
            .find(|(_, link)| link.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PlayerId, &mut PlayerLink)> {
        self.players.iter_mut()
    }

    /// Removes players at the missed-keepalive limit; peer death is
    /// normal churn, not an error.
    pub fn purge_timed_out(&mut self, limit: u32) -> Vec<PlayerId> {
        let timed_out: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|(_, link)| link.missed_pings >= limit)
            .map(|(id, _)| *id)
            .collect();
        for id in &timed_out {
            self.players.remove(id);
        }
        timed_out
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
