//! Quorum network layer: heartbeat loop over UDP, and TCP coordination
//! endpoints for player front assignment and move confirmation.

use crate::registry::{fail_front, FrontTransport, Registry};
use log::{error, info, warn};
use shared::config::ClusterConfig;
use shared::coord::{self, Request, Response};
use shared::protocol::{self, Datagram, MAX_DATAGRAM};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;

/// How many times startup seeding retries a front before escalating.
const SEED_ATTEMPTS: u32 = 30;
const SEED_BACKOFF: Duration = Duration::from_secs(1);

/// TCP implementation of the coordination side effects.
#[derive(Clone, Copy)]
pub struct TcpTransport {
    pub call_timeout: Duration,
}

impl FrontTransport for TcpTransport {
    async fn adopt_section(
        &self,
        front: SocketAddr,
        source: SocketAddr,
        section: shared::world::SectionId,
        neighbors: shared::world::NeighborLinks,
    ) -> bool {
        let request = Request::AdoptSection {
            source,
            section,
            neighbors,
        };
        matches!(
            coord::try_call(front, &request, self.call_timeout).await,
            Response::Ok
        )
    }

    async fn patch_neighbors(
        &self,
        front: SocketAddr,
        section: shared::world::SectionId,
        neighbors: shared::world::NeighborLinks,
    ) -> bool {
        let request = Request::PatchNeighbors { section, neighbors };
        matches!(
            coord::try_call(front, &request, self.call_timeout).await,
            Response::Ok
        )
    }

    async fn attach_player(
        &self,
        front: SocketAddr,
        player: shared::world::PlayerRecord,
    ) -> bool {
        let request = Request::AttachPlayer { player };
        matches!(
            coord::try_call(front, &request, self.call_timeout).await,
            Response::Ok
        )
    }
}

pub struct QuorumServer {
    config: ClusterConfig,
    socket: Arc<UdpSocket>,
    registry: Arc<RwLock<Registry>>,
    transport: TcpTransport,
}

impl QuorumServer {
    pub async fn bind(config: ClusterConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let addr = config.quorum_addr;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("quorum listening on {}", addr);
        let registry = Arc::new(RwLock::new(Registry::from_config(&config)));
        let transport = TcpTransport {
            call_timeout: config.call_timeout,
        };
        Ok(Self {
            config,
            socket,
            registry,
            transport,
        })
    }

    /// Tells each front to adopt its initial sections from the store.
    /// Bounded retry with a fixed backoff; an unreachable front is
    /// escalated to the log and left for failure detection to handle.
    pub async fn seed_initial_sections(&self) {
        for seed in &self.config.sections {
            let Some(front_addr) = self.config.front_addr(seed.front) else {
                warn!("section {} names unknown front {}", seed.id, seed.front);
                continue;
            };
            let mut adopted = false;
            for attempt in 1..=SEED_ATTEMPTS {
                if self
                    .transport
                    .adopt_section(
                        front_addr,
                        self.config.store_addr,
                        seed.id,
                        seed.neighbors.clone(),
                    )
                    .await
                {
                    info!("front {} adopted section {}", seed.front, seed.id);
                    adopted = true;
                    break;
                }
                info!(
                    "front {} not ready for section {} (attempt {}/{})",
                    seed.front, seed.id, attempt, SEED_ATTEMPTS
                );
                tokio::time::sleep(SEED_BACKOFF).await;
            }
            if !adopted {
                error!(
                    "giving up seeding section {} to front {}; failover will retry",
                    seed.id, seed.front
                );
            }
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.config.quorum_addr).await?;
        let registry = Arc::clone(&self.registry);
        let call_timeout = self.config.call_timeout;
        tokio::spawn(coord::serve(listener, move |request, _peer| {
            let registry = Arc::clone(&registry);
            async move { handle_request(registry, request, call_timeout).await }
        }));

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut buffer = [0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) => {
                            if let Ok(Datagram::HeartbeatPong) = protocol::decode(&buffer[..len]) {
                                self.registry.write().await.record_pong(addr);
                            }
                        }
                        Err(e) => {
                            error!("error receiving heartbeat reply: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                },

                _ = heartbeat.tick() => {
                    self.heartbeat_cycle().await;
                },
            }
        }
    }

    /// One detection cycle: reassign any overdue fronts, then ping
    /// everyone and charge a missed heartbeat until their reply arrives.
    async fn heartbeat_cycle(&self) {
        let limit = self.config.missed_ping_limit;
        let mut registry = self.registry.write().await;

        for id in registry.overdue_fronts(limit) {
            fail_front(
                &mut registry,
                id,
                self.config.store_addr,
                limit,
                &self.transport,
            )
            .await;
        }

        let targets: Vec<SocketAddr> = registry.fronts.values().map(|f| f.addr).collect();
        for front in registry.fronts.values_mut() {
            front.missed += 1;
        }
        drop(registry);

        for addr in targets {
            if let Err(e) = protocol::send_datagram(
                &self.socket,
                &Datagram::HeartbeatPing,
                addr,
                self.config.packet_loss_pct,
            )
            .await
            {
                error!("error pinging front at {}: {}", addr, e);
            }
        }
    }
}

/// Coordination endpoints. `AssignFront` is what the login redirector
/// forwards to; `ConfirmMove` is the ownership commit point for every
/// handoff.
async fn handle_request(
    registry: Arc<RwLock<Registry>>,
    request: Request,
    call_timeout: Duration,
) -> Response {
    match request {
        Request::AssignFront {
            player,
            addr,
            session,
        } => {
            let (record, front_addr) = {
                let mut registry = registry.write().await;
                let Some(record) = registry.players.get_mut(&player) else {
                    warn!("front requested for unknown player {}", player);
                    return Response::NotFound;
                };
                record.addr = Some(addr);
                record.session = session;
                let record = record.clone();
                let Some(front) = registry.fronts.get(&record.front) else {
                    return Response::Unavailable;
                };
                if front.failed {
                    return Response::Unavailable;
                }
                (record, front.addr)
            };

            let transport = TcpTransport { call_timeout };
            if transport.attach_player(front_addr, record.clone()).await {
                info!(
                    "giving front {} to {} at {}",
                    front_addr, record.name, addr
                );
                Response::Front(front_addr)
            } else {
                Response::Unavailable
            }
        }

        Request::ConfirmMove {
            object_id,
            front,
            section,
        } => {
            let mut registry = registry.write().await;
            let Some(front_id) = registry.find_front_by_addr(front) else {
                warn!("move names unknown front {}", front);
                return Response::NotFound;
            };
            if let Some(player) = registry.players.get_mut(&object_id) {
                player.front = front_id;
                player.section = section;
                info!(
                    "player {} moved to front {} section {}",
                    object_id, front_id, section
                );
            }
            Response::Ok
        }

        _ => Response::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<RwLock<Registry>> {
        Arc::new(RwLock::new(Registry::from_config(&ClusterConfig::default())))
    }

    #[tokio::test]
    async fn test_confirm_move_updates_player_mapping() {
        let registry = registry();
        let front2: SocketAddr = "127.0.0.1:10102".parse().unwrap();

        let response = handle_request(
            Arc::clone(&registry),
            Request::ConfirmMove {
                object_id: 1,
                front: front2,
                section: 2,
            },
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(response, Response::Ok);

        let registry = registry.read().await;
        assert_eq!(registry.players[&1].front, 2);
        assert_eq!(registry.players[&1].section, 2);
    }

    #[tokio::test]
    async fn test_confirm_move_for_plain_object_is_ok() {
        let registry = registry();
        let front1: SocketAddr = "127.0.0.1:10101".parse().unwrap();

        // Object 100 is not a player; the move is acknowledged without
        // touching the player table.
        let response = handle_request(
            Arc::clone(&registry),
            Request::ConfirmMove {
                object_id: 100,
                front: front1,
                section: 1,
            },
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(response, Response::Ok);
        assert_eq!(registry.read().await.players.len(), 2);
    }

    #[tokio::test]
    async fn test_confirm_move_unknown_front_rejected() {
        let registry = registry();
        let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let response = handle_request(
            registry,
            Request::ConfirmMove {
                object_id: 1,
                front: stranger,
                section: 1,
            },
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(response, Response::NotFound);
    }

    #[tokio::test]
    async fn test_assign_front_unknown_player() {
        let registry = registry();
        let response = handle_request(
            registry,
            Request::AssignFront {
                player: 99,
                addr: "127.0.0.1:5000".parse().unwrap(),
                session: "S".to_string(),
            },
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(response, Response::NotFound);
    }

    #[tokio::test]
    async fn test_assign_front_failed_front_unavailable() {
        let registry = registry();
        registry.write().await.fronts.get_mut(&1).unwrap().failed = true;
        let response = handle_request(
            registry,
            Request::AssignFront {
                player: 1,
                addr: "127.0.0.1:5000".parse().unwrap(),
                session: "S".to_string(),
            },
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(response, Response::Unavailable);
    }
}
