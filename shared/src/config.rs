//! Cluster configuration: addresses, section geometry, timeouts, and the
//! initial world layout. The default reproduces a two-front world with
//! two adjacent sections; a JSON file can override it.

use crate::world::{
    FrontId, NeighborLinks, Object, ObjectId, PlayerId, SectionGeometry, SectionId,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FrontSeed {
    pub id: FrontId,
    pub addr: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SectionSeed {
    pub id: SectionId,
    pub name: String,
    /// Front that owns this section at startup.
    pub front: FrontId,
    pub neighbors: NeighborLinks,
    pub objects: Vec<(ObjectId, Object)>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlayerSeed {
    pub id: PlayerId,
    pub name: String,
    pub front: FrontId,
    pub section: SectionId,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    pub section_width: f64,
    pub section_height: f64,
    pub quorum_addr: SocketAddr,
    pub store_addr: SocketAddr,
    pub fronts: Vec<FrontSeed>,
    pub sections: Vec<SectionSeed>,
    pub players: Vec<PlayerSeed>,
    /// A front that hears nothing from quorum for this long terminates.
    pub front_timeout: Duration,
    /// Consecutive missed keepalives before a peer is declared dead.
    pub missed_ping_limit: u32,
    pub player_initial_rtt: Duration,
    /// Fixed retransmission interval on the front→store link.
    pub store_resend_interval: Duration,
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
    /// Bound on every coordination request/response exchange.
    pub call_timeout: Duration,
    /// Percentage of outbound datagrams dropped artificially for testing.
    pub packet_loss_pct: u8,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn geometry(&self) -> SectionGeometry {
        SectionGeometry {
            width: self.section_width,
            height: self.section_height,
        }
    }

    pub fn front_addr(&self, id: FrontId) -> Option<SocketAddr> {
        self.fronts.iter().find(|f| f.id == id).map(|f| f.addr)
    }

    pub fn sections_for_front(&self, id: FrontId) -> impl Iterator<Item = &SectionSeed> {
        self.sections.iter().filter(move |s| s.front == id)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let front1 = SocketAddr::from(([127, 0, 0, 1], 10101));
        let front2 = SocketAddr::from(([127, 0, 0, 1], 10102));
        Self {
            section_width: 100.0,
            section_height: 100.0,
            quorum_addr: SocketAddr::from(([127, 0, 0, 1], 10000)),
            store_addr: SocketAddr::from(([127, 0, 0, 1], 10002)),
            fronts: vec![
                FrontSeed {
                    id: 1,
                    addr: front1,
                },
                FrontSeed {
                    id: 2,
                    addr: front2,
                },
            ],
            sections: vec![
                SectionSeed {
                    id: 1,
                    name: "Section #1".to_string(),
                    front: 1,
                    neighbors: NeighborLinks {
                        east: Some((front2, 2)),
                        ..Default::default()
                    },
                    objects: vec![
                        (1, Object::new("Player #1 ship", (1.0, 1.0), 0.0, 90.0)),
                        (100, Object::new("Planet #1", (0.0, 0.0), 0.0, 0.0)),
                    ],
                },
                SectionSeed {
                    id: 2,
                    name: "Section #2".to_string(),
                    front: 2,
                    neighbors: NeighborLinks {
                        west: Some((front1, 1)),
                        ..Default::default()
                    },
                    objects: vec![(2, Object::new("Player #2 ship", (10.0, 10.0), 0.0, 180.0))],
                },
            ],
            players: vec![
                PlayerSeed {
                    id: 1,
                    name: "Player #1".to_string(),
                    front: 1,
                    section: 1,
                },
                PlayerSeed {
                    id: 2,
                    name: "Player #2".to_string(),
                    front: 2,
                    section: 2,
                },
            ],
            front_timeout: Duration::from_secs(5),
            missed_ping_limit: 5,
            player_initial_rtt: Duration::from_secs(1),
            store_resend_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            tick_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(2),
            packet_loss_pct: 0,
        }
    }
}
