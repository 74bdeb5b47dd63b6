//! Store network layer: UDP listener for the section update stream and
//! the TCP coordination listener for snapshot retrieval/registration.

use crate::replica::Replica;
use log::{error, info, warn};
use shared::config::ClusterConfig;
use shared::coord::{self, Request, Response};
use shared::protocol::{self, Datagram, MAX_DATAGRAM};
use shared::world::SectionSnapshot;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;

pub struct StoreServer {
    config: ClusterConfig,
    socket: Arc<UdpSocket>,
    listener: TcpListener,
    replica: Arc<RwLock<Replica>>,
    update_addr: SocketAddr,
    coord_addr: SocketAddr,
}

impl StoreServer {
    /// Binds the update socket and the coordination listener. Production
    /// uses the same address for both (UDP and TCP port spaces are
    /// separate); tests pass ephemeral addresses.
    pub async fn bind(
        config: ClusterConfig,
        udp_addr: SocketAddr,
        coord_addr: SocketAddr,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(udp_addr).await?);
        let listener = TcpListener::bind(coord_addr).await?;
        let update_addr = socket.local_addr()?;
        let coord_addr = listener.local_addr()?;
        info!(
            "store listening on {} (updates) and {} (coordination)",
            update_addr, coord_addr
        );
        Ok(Self {
            config,
            socket,
            listener,
            replica: Arc::new(RwLock::new(Replica::new())),
            update_addr,
            coord_addr,
        })
    }

    pub fn update_addr(&self) -> SocketAddr {
        self.update_addr
    }

    pub fn coord_addr(&self) -> SocketAddr {
        self.coord_addr
    }

    /// Installs the initial world from the configuration, attributing
    /// each section to its configured front.
    pub async fn seed_initial_sections(&self) {
        let mut replica = self.replica.write().await;
        for seed in &self.config.sections {
            let Some(front_addr) = self.config.front_addr(seed.front) else {
                warn!("section {} names unknown front {}", seed.id, seed.front);
                continue;
            };
            info!("adding initial section {}", seed.id);
            let snapshot = SectionSnapshot {
                id: seed.id,
                name: seed.name.clone(),
                version: 0,
                objects: seed.objects.iter().cloned().collect(),
            };
            replica.register(seed.id, snapshot, seed.front, front_addr);
        }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let replica = Arc::clone(&self.replica);
        let listener = self.listener;
        tokio::spawn(coord::serve(listener, move |request, _peer| {
            let replica = Arc::clone(&replica);
            async move { handle_request(replica, request).await }
        }));

        let mut buffer = [0u8; MAX_DATAGRAM];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    error!("error receiving update: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };
            let datagram = match protocol::decode(&buffer[..len]) {
                Ok(datagram) => datagram,
                Err(_) => {
                    warn!("undecodable datagram from {}", addr);
                    continue;
                }
            };
            if let Datagram::StoreUpdate {
                section,
                version,
                object_id,
                object,
            } = datagram
            {
                let ack = {
                    let mut replica = self.replica.write().await;
                    replica.apply_update(addr, section, version, object_id, object)
                };
                if let Some(version) = ack {
                    let ack = Datagram::StoreAck { section, version };
                    if let Err(e) = protocol::send_datagram(
                        &self.socket,
                        &ack,
                        addr,
                        self.config.packet_loss_pct,
                    )
                    .await
                    {
                        error!("error acknowledging to {}: {}", addr, e);
                    }
                }
            }
        }
    }
}

async fn handle_request(replica: Arc<RwLock<Replica>>, request: Request) -> Response {
    match request {
        Request::FetchSection { section } => {
            let replica = replica.read().await;
            match replica.fetch(section) {
                Some(snapshot) => {
                    info!("section {} requested, sending", section);
                    Response::Section(snapshot)
                }
                None => {
                    warn!("section {} requested but we don't have it", section);
                    Response::NotFound
                }
            }
        }
        Request::RegisterSection {
            section,
            snapshot,
            front_id,
            front_addr,
        } => {
            let mut replica = replica.write().await;
            replica.register(section, snapshot, front_id, front_addr);
            Response::Ok
        }
        _ => Response::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::world::Object;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_fetch_and_register_over_coordination() {
        let replica = Arc::new(RwLock::new(Replica::new()));
        let owner: SocketAddr = "127.0.0.1:10101".parse().unwrap();

        let missing = handle_request(
            Arc::clone(&replica),
            Request::FetchSection { section: 1 },
        )
        .await;
        assert_eq!(missing, Response::NotFound);

        let mut objects = HashMap::new();
        objects.insert(1, Object::new("ship", (1.0, 1.0), 0.0, 90.0));
        let snapshot = SectionSnapshot {
            id: 1,
            name: "Section #1".to_string(),
            version: 4,
            objects,
        };
        let registered = handle_request(
            Arc::clone(&replica),
            Request::RegisterSection {
                section: 1,
                snapshot: snapshot.clone(),
                front_id: 1,
                front_addr: owner,
            },
        )
        .await;
        assert_eq!(registered, Response::Ok);

        let fetched = handle_request(replica, Request::FetchSection { section: 1 }).await;
        assert_eq!(fetched, Response::Section(snapshot));
    }

    #[tokio::test]
    async fn test_unrelated_requests_are_not_found() {
        let replica = Arc::new(RwLock::new(Replica::new()));
        let response = handle_request(
            replica,
            Request::ConfirmMove {
                object_id: 1,
                front: "127.0.0.1:10101".parse().unwrap(),
                section: 1,
            },
        )
        .await;
        assert_eq!(response, Response::NotFound);
    }
}
