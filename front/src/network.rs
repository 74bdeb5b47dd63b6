//! Front network layer: the UDP event loop for player/store/quorum
//! datagrams, the periodic tick and keepalive drivers, retransmission,
//! and the TCP coordination endpoints.
//!
//! Lock order is fixed across the crate: section state before player
//! state; the resend queues are leaf locks taken last.

use crate::players::PlayerTable;
use crate::world::{self, Section};
use log::{debug, error, info, warn};
use shared::channel::{ResendQueue, SendChannel};
use shared::config::ClusterConfig;
use shared::coord::{self, Request, Response};
use shared::protocol::{self, Command, Datagram, MAX_DATAGRAM};
use shared::world::{FrontId, NeighborLinks, ObjectId, PlayerId, SectionId};
use shared::now_millis;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;

/// Attempts to re-register an adopted section with the store before the
/// escalation log entry; the update stream stalls until one succeeds.
const STORE_REGISTER_ATTEMPTS: u32 = 3;
const STORE_REGISTER_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum FrontError {
    #[error("front {0} is not in the cluster configuration")]
    UnknownFront(FrontId),
    #[error("no contact from quorum within the liveness window")]
    QuorumSilent,
}

/// The front server: owns the datagram socket, the sections assigned by
/// quorum, and the players attached to them.
pub struct FrontServer {
    pub(crate) id: FrontId,
    pub(crate) addr: SocketAddr,
    pub(crate) config: ClusterConfig,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) sections: Arc<RwLock<HashMap<SectionId, Section>>>,
    pub(crate) players: Arc<RwLock<PlayerTable>>,
    pub(crate) player_resend: Mutex<ResendQueue<(PlayerId, u64)>>,
    pub(crate) store_resend: Mutex<ResendQueue<(SectionId, u64)>>,
    pub(crate) last_quorum_ping: RwLock<Instant>,
}

impl FrontServer {
    pub async fn new(
        id: FrontId,
        config: ClusterConfig,
    ) -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let addr = config.front_addr(id).ok_or(FrontError::UnknownFront(id))?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("front {} listening on {}", id, addr);

        Ok(Arc::new(Self {
            id,
            addr,
            config,
            socket,
            sections: Arc::new(RwLock::new(HashMap::new())),
            players: Arc::new(RwLock::new(PlayerTable::new())),
            player_resend: Mutex::new(ResendQueue::new()),
            store_resend: Mutex::new(ResendQueue::new()),
            last_quorum_ping: RwLock::new(Instant::now()),
        }))
    }

    fn loss(&self) -> u8 {
        self.config.packet_loss_pct
    }

    /// Main event loop: datagram dispatch, the world tick, player
    /// keepalives, and retransmission, with the sleep arm sized to the
    /// earliest pending resend deadline.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.addr).await?;
        let srv = Arc::clone(&self);
        tokio::spawn(coord::serve(listener, move |request, peer| {
            let srv = Arc::clone(&srv);
            async move { srv.handle_request(request, peer).await }
        }));

        let mut tick = interval(self.config.tick_interval);
        let mut keepalive = interval(self.config.heartbeat_interval);
        let mut buffer = [0u8; MAX_DATAGRAM];

        info!("front {} running", self.id);

        loop {
            let resend_at = self
                .earliest_resend_deadline()
                .await
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(1));

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) => match protocol::decode(&buffer[..len]) {
                            Ok(datagram) => self.handle_datagram(datagram, addr).await,
                            Err(_) => warn!("undecodable datagram from {}", addr),
                        },
                        Err(e) => {
                            error!("error receiving datagram: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                },

                _ = tick.tick() => {
                    if self.last_quorum_ping.read().await.elapsed() > self.config.front_timeout {
                        error!("quorum silent past the liveness window, terminating");
                        return Err(FrontError::QuorumSilent.into());
                    }
                    self.tick_sections().await;
                },

                _ = keepalive.tick() => {
                    self.ping_players().await;
                },

                _ = tokio::time::sleep_until(resend_at.into()) => {
                    self.process_resends().await;
                },
            }
        }
    }

    async fn handle_datagram(&self, datagram: Datagram, addr: SocketAddr) {
        if addr == self.config.quorum_addr {
            if matches!(datagram, Datagram::HeartbeatPing) {
                *self.last_quorum_ping.write().await = Instant::now();
                let _ = protocol::send_datagram(
                    &self.socket,
                    &Datagram::HeartbeatPong,
                    addr,
                    self.loss(),
                )
                .await;
            }
            return;
        }
        if addr == self.config.store_addr {
            if let Datagram::StoreAck { section, version } = datagram {
                self.handle_store_ack(section, version).await;
            }
            return;
        }

        match datagram {
            Datagram::Pong { timestamp_ms } => self.handle_pong(addr, timestamp_ms).await,
            Datagram::Ack { ack } => self.handle_player_ack(addr, ack).await,
            Datagram::Command { sequence, command } => {
                self.handle_player_command(addr, sequence, command).await;
            }
            Datagram::Quit => {
                let mut players = self.players.write().await;
                match players.find_by_addr(addr) {
                    Some(id) => {
                        info!("player {} quit", id);
                        players.remove(id);
                    }
                    None => {
                        drop(players);
                        self.send_wrong_front(addr).await;
                    }
                }
            }
            _ => {
                let known = self.players.read().await.find_by_addr(addr).is_some();
                if known {
                    debug!("unexpected datagram from player at {}", addr);
                } else {
                    self.send_wrong_front(addr).await;
                }
            }
        }
    }

    /// Unknown senders get a cue to look up their front again.
    async fn send_wrong_front(&self, addr: SocketAddr) {
        let _ =
            protocol::send_datagram(&self.socket, &Datagram::WrongFront, addr, self.loss()).await;
    }

    async fn handle_pong(&self, addr: SocketAddr, timestamp_ms: u64) {
        let mut players = self.players.write().await;
        let Some(id) = players.find_by_addr(addr) else {
            drop(players);
            self.send_wrong_front(addr).await;
            return;
        };
        if let Some(link) = players.get_mut(id) {
            link.missed_pings = 0;
            let sample = now_millis().saturating_sub(timestamp_ms);
            link.rtt.update(Duration::from_millis(sample));
        }
    }

    /// Cumulative ack from a player: retire delivered updates and fast
    /// retransmit the first one the player is evidently missing.
    async fn handle_player_ack(&self, addr: SocketAddr, ack: u64) {
        let mut players = self.players.write().await;
        let Some(id) = players.find_by_addr(addr) else {
            drop(players);
            self.send_wrong_front(addr).await;
            return;
        };
        let Some(link) = players.get_mut(id) else {
            return;
        };
        let Some(updates) = link.updates.as_mut() else {
            return;
        };
        if let Some((version, bytes)) = updates.on_ack(ack) {
            debug!("fast resend of version {} to player {}", version, id);
            let deadline = Instant::now() + link.rtt.resend_delay();
            let target = link.addr;
            let _ = protocol::send_raw(&self.socket, &bytes, target, self.loss()).await;
            self.player_resend.lock().await.push(deadline, (id, version));
        }
    }

    async fn handle_player_command(&self, addr: SocketAddr, sequence: u64, command: Command) {
        let mut sections = self.sections.write().await;
        let mut players = self.players.write().await;
        let Some(id) = players.find_by_addr(addr) else {
            drop(players);
            drop(sections);
            self.send_wrong_front(addr).await;
            return;
        };

        let (ack, ready) = match players.get_mut(id) {
            Some(link) => {
                let ready = link.commands.accept(sequence, command);
                (link.commands.cumulative_ack(), ready)
            }
            None => return,
        };
        let _ = protocol::send_datagram(&self.socket, &Datagram::Ack { ack }, addr, self.loss())
            .await;

        for (_, command) in ready {
            self.apply_player_command(&mut sections, &mut players, id, command)
                .await;
        }
    }

    async fn apply_player_command(
        &self,
        sections: &mut HashMap<SectionId, Section>,
        players: &mut PlayerTable,
        id: PlayerId,
        command: Command,
    ) {
        let Some(section_id) = players.get(id).map(|link| link.record.section) else {
            return;
        };
        {
            let Some(section) = sections.get_mut(&section_id) else {
                return;
            };
            let Some(tracked) = section.live_object_mut(id) else {
                return;
            };
            world::apply_command(tracked, command, Instant::now());
        }
        self.broadcast_update(sections, players, section_id, id)
            .await;
    }

    async fn handle_store_ack(&self, section_id: SectionId, version: u64) {
        let mut sections = self.sections.write().await;
        let Some(section) = sections.get_mut(&section_id) else {
            return;
        };
        if let Some((seq, bytes)) = section.store_out.on_ack(version) {
            debug!("fast resend of section {} version {} to store", section_id, seq);
            let _ = protocol::send_raw(&self.socket, &bytes, self.config.store_addr, self.loss())
                .await;
            self.store_resend
                .lock()
                .await
                .push(Instant::now() + self.config.store_resend_interval, (section_id, seq));
        }
    }

    /// Commits one mutation of `object_id` in `section_id` and pushes the
    /// update to the store and to every player subscribed to the section,
    /// arming retransmission for each. Broadcast and version bump are one
    /// atomic step under the section/player locks.
    pub(crate) async fn broadcast_update(
        &self,
        sections: &mut HashMap<SectionId, Section>,
        players: &mut PlayerTable,
        section_id: SectionId,
        object_id: ObjectId,
    ) {
        let Some(section) = sections.get_mut(&section_id) else {
            return;
        };
        let (version, object) = section.commit(object_id);

        let store_update = Datagram::StoreUpdate {
            section: section_id,
            version,
            object_id,
            object: object.clone(),
        };
        if let Ok(bytes) = bincode::serialize(&store_update) {
            section.store_out.register(version, bytes.clone());
            let _ = protocol::send_raw(&self.socket, &bytes, self.config.store_addr, self.loss())
                .await;
            self.store_resend
                .lock()
                .await
                .push(Instant::now() + self.config.store_resend_interval, (section_id, version));
        }

        let update = Datagram::Update {
            version,
            object_id,
            object,
        };
        let Ok(bytes) = bincode::serialize(&update) else {
            return;
        };
        for (id, link) in players.iter_mut() {
            if link.record.section != section_id {
                continue;
            }
            let Some(updates) = link.updates.as_mut() else {
                continue;
            };
            updates.register(version, bytes.clone());
            let deadline = Instant::now() + link.rtt.resend_delay();
            let _ = protocol::send_raw(&self.socket, &bytes, link.addr, self.loss()).await;
            self.player_resend.lock().await.push(deadline, (*id, version));
        }
    }

    /// Advances every owned section and resolves the resulting boundary
    /// crossings.
    async fn tick_sections(&self) {
        let mut sections = self.sections.write().await;
        let mut players = self.players.write().await;
        let ids: Vec<SectionId> = sections.keys().copied().collect();
        for id in ids {
            self.tick_one_section(&mut sections, &mut players, id).await;
        }
    }

    pub(crate) async fn tick_one_section(
        &self,
        sections: &mut HashMap<SectionId, Section>,
        players: &mut PlayerTable,
        section_id: SectionId,
    ) {
        let geometry = self.config.geometry();
        let now = Instant::now();
        let result = match sections.get_mut(&section_id) {
            Some(section) => world::tick_section(section, &geometry, now),
            None => return,
        };
        for object_id in result.moved {
            self.broadcast_update(sections, players, section_id, object_id)
                .await;
        }
        for crossing in result.crossings {
            self.resolve_crossing(sections, players, section_id, crossing)
                .await;
        }
    }

    /// Pings every player and purges the ones past the keepalive limit.
    async fn ping_players(&self) {
        let mut players = self.players.write().await;
        for (_, link) in players.iter_mut() {
            link.missed_pings += 1;
            let ping = Datagram::Ping {
                rtt_ms: link.rtt.as_millis(),
                timestamp_ms: now_millis(),
            };
            let _ = protocol::send_datagram(&self.socket, &ping, link.addr, self.loss()).await;
        }
        for id in players.purge_timed_out(self.config.missed_ping_limit) {
            info!("player {} timed out", id);
        }
    }

    async fn earliest_resend_deadline(&self) -> Option<Instant> {
        let player = self.player_resend.lock().await.next_deadline();
        let store = self.store_resend.lock().await.next_deadline();
        match (player, store) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    /// Retransmits every due unacknowledged update and re-arms its
    /// deadline at twice the link's current RTT (fixed interval for the
    /// store link).
    async fn process_resends(&self) {
        let now = Instant::now();
        loop {
            let due = self.player_resend.lock().await.pop_due(now);
            let Some((id, version)) = due else { break };
            let resend = {
                let mut players = self.players.write().await;
                players.get_mut(id).and_then(|link| {
                    let updates = link.updates.as_mut()?;
                    let bytes = updates.payload(version)?.clone();
                    Some((bytes, link.addr, link.rtt.resend_delay()))
                })
            };
            if let Some((bytes, addr, delay)) = resend {
                debug!("resending version {} to player {}", version, id);
                let _ = protocol::send_raw(&self.socket, &bytes, addr, self.loss()).await;
                self.player_resend.lock().await.push(now + delay, (id, version));
            }
        }

        loop {
            let due = self.store_resend.lock().await.pop_due(now);
            let Some((section_id, version)) = due else { break };
            let bytes = {
                let sections = self.sections.read().await;
                sections
                    .get(&section_id)
                    .and_then(|section| section.store_out.payload(version).cloned())
            };
            if let Some(bytes) = bytes {
                debug!("resending section {} version {} to store", section_id, version);
                let _ = protocol::send_raw(&self.socket, &bytes, self.config.store_addr, self.loss())
                    .await;
                self.store_resend
                    .lock()
                    .await
                    .push(now + self.config.store_resend_interval, (section_id, version));
            }
        }
    }

    /// Coordination endpoints (quorum and peer fronts call these).
    pub(crate) async fn handle_request(
        self: Arc<Self>,
        request: Request,
        _peer: SocketAddr,
    ) -> Response {
        match request {
            Request::AttachPlayer { player } => {
                info!("adding player {} ({})", player.id, player.name);
                let mut players = self.players.write().await;
                if players.attach(player, self.config.player_initial_rtt) {
                    Response::Ok
                } else {
                    Response::NotFound
                }
            }

            Request::SectionFeed { player, session } => {
                self.handle_section_feed(player, session).await
            }

            Request::AdoptSection {
                source,
                section,
                neighbors,
            } => self.handle_adopt_section(source, section, neighbors).await,

            Request::TransferObject {
                object_id,
                object,
                section,
                player,
            } => {
                self.accept_transfer(object_id, object, section, player)
                    .await
            }

            Request::PatchNeighbors { section, neighbors } => {
                let mut sections = self.sections.write().await;
                match sections.get_mut(&section) {
                    Some(owned) => {
                        info!("updating neighbors for section {}", section);
                        owned.neighbors.merge(&neighbors);
                        Response::Ok
                    }
                    None => Response::NotFound,
                }
            }

            _ => Response::NotFound,
        }
    }

    /// Returns the player's section snapshot and anchors their update
    /// feed at its version. The section is ticked first so the snapshot
    /// reflects current motion.
    async fn handle_section_feed(&self, player_id: PlayerId, session: String) -> Response {
        let mut sections = self.sections.write().await;
        let mut players = self.players.write().await;

        let Some(link) = players.get(player_id) else {
            return Response::NotFound;
        };
        if link.record.session != session {
            warn!("session mismatch for player {}", player_id);
            return Response::NotFound;
        }
        let section_id = link.record.section;
        if !sections.contains_key(&section_id) {
            return Response::NotFound;
        }

        self.tick_one_section(&mut sections, &mut players, section_id)
            .await;

        let Some(section) = sections.get(&section_id) else {
            return Response::NotFound;
        };
        let snapshot = section.snapshot();
        let version = section.version;
        if let Some(link) = players.get_mut(player_id) {
            link.updates = Some(SendChannel::with_base(version));
            info!("giving section {} to player {}", section_id, player_id);
        }
        Response::Section(snapshot)
    }

    /// Adopts a section: fetch the snapshot from the store, install it
    /// with the neighbor links quorum recorded, then re-register
    /// ownership with the store in the background (bounded retries).
    async fn handle_adopt_section(
        self: Arc<Self>,
        source: SocketAddr,
        section_id: SectionId,
        neighbors: NeighborLinks,
    ) -> Response {
        info!("told to fetch section {} from {}", section_id, source);
        let response = coord::try_call(
            source,
            &Request::FetchSection {
                section: section_id,
            },
            self.config.call_timeout,
        )
        .await;
        let Response::Section(snapshot) = response else {
            warn!("could not fetch section {} from {}", section_id, source);
            return Response::Unavailable;
        };

        {
            let mut sections = self.sections.write().await;
            sections.insert(section_id, Section::from_snapshot(snapshot, neighbors));
        }

        let srv = Arc::clone(&self);
        tokio::spawn(async move {
            srv.register_with_store(section_id).await;
        });
        Response::Ok
    }

    /// Registers this front as the section's owner with the store so the
    /// update stream passes the stale-owner check.
    async fn register_with_store(&self, section_id: SectionId) {
        for _ in 0..STORE_REGISTER_ATTEMPTS {
            let snapshot = {
                let sections = self.sections.read().await;
                sections.get(&section_id).map(|section| section.snapshot())
            };
            let Some(snapshot) = snapshot else {
                return;
            };
            let version = snapshot.version;
            let request = Request::RegisterSection {
                section: section_id,
                snapshot,
                front_id: self.id,
                front_addr: self.addr,
            };
            if matches!(
                coord::try_call(self.config.store_addr, &request, self.config.call_timeout).await,
                Response::Ok
            ) {
                let mut sections = self.sections.write().await;
                if let Some(section) = sections.get_mut(&section_id) {
                    // The registered snapshot covers everything up to its
                    // version; only newer updates still need the stream.
                    let _ = section.store_out.on_ack(version);
                }
                return;
            }
            tokio::time::sleep(STORE_REGISTER_BACKOFF).await;
        }
        error!(
            "could not register section {} with the store; its update stream will stall",
            section_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Section;
    use shared::world::{Object, PlayerRecord, SectionSnapshot};

    async fn test_server() -> Arc<FrontServer> {
        let mut config = ClusterConfig::default();
        // Ephemeral socket so tests never collide on ports.
        config.fronts[0].addr = "127.0.0.1:0".parse().unwrap();
        FrontServer::new(1, config).await.unwrap()
    }

    fn player_addr() -> SocketAddr {
        "127.0.0.1:5501".parse().unwrap()
    }

    fn record(id: PlayerId, section: SectionId) -> PlayerRecord {
        PlayerRecord {
            id,
            name: format!("Player #{}", id),
            session: "SESSION".to_string(),
            front: 1,
            section,
            addr: Some(player_addr()),
        }
    }

    fn section_with_ship(id: SectionId, ship: ObjectId) -> Section {
        let mut objects = std::collections::HashMap::new();
        objects.insert(ship, Object::new("ship", (0.0, 0.0), 0.0, 0.0));
        Section::from_snapshot(
            SectionSnapshot {
                id,
                name: format!("Section #{}", id),
                version: 0,
                objects,
            },
            NeighborLinks::default(),
        )
    }

    #[tokio::test]
    async fn test_player_ack_prunes_and_fast_retransmits() {
        let srv = test_server().await;
        {
            let mut players = srv.players.write().await;
            players.attach(record(1, 1), Duration::from_secs(1));
            let link = players.get_mut(1).unwrap();
            // Feed anchored at version 3 with versions 4 and 5 in flight.
            let mut channel = SendChannel::with_base(3);
            channel.register(4, b"v4".to_vec());
            channel.register(5, b"v5".to_vec());
            link.updates = Some(channel);
        }

        // The player reports 3 applied: 4 is evidently missing, so it is
        // fast-retransmitted and stays in flight together with 5.
        srv.handle_player_ack(player_addr(), 3).await;
        {
            let players = srv.players.read().await;
            let updates = players.get(1).unwrap().updates.as_ref().unwrap();
            assert_eq!(updates.in_flight(), 2);
        }
        assert!(!srv.player_resend.lock().await.is_empty());

        // Acking 5 retires everything.
        srv.handle_player_ack(player_addr(), 5).await;
        let players = srv.players.read().await;
        let updates = players.get(1).unwrap().updates.as_ref().unwrap();
        assert_eq!(updates.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_commits_once_and_arms_retransmission() {
        let srv = test_server().await;
        {
            let mut sections = srv.sections.write().await;
            sections.insert(1, section_with_ship(1, 1));
            let mut players = srv.players.write().await;
            players.attach(record(1, 1), Duration::from_secs(1));
            players.get_mut(1).unwrap().updates = Some(SendChannel::with_base(0));
        }

        let mut sections = srv.sections.write().await;
        let mut players = srv.players.write().await;
        srv.broadcast_update(&mut sections, &mut players, 1, 1).await;

        let section = sections.get(&1).unwrap();
        assert_eq!(section.version, 1);
        assert_eq!(section.store_out.in_flight(), 1);
        let updates = players.get(1).unwrap().updates.as_ref().unwrap();
        assert_eq!(updates.in_flight(), 1);
        drop(players);
        drop(sections);

        assert!(!srv.store_resend.lock().await.is_empty());
        assert!(!srv.player_resend.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_players_in_other_sections() {
        let srv = test_server().await;
        {
            let mut sections = srv.sections.write().await;
            sections.insert(1, section_with_ship(1, 1));
            sections.insert(2, section_with_ship(2, 2));
            let mut players = srv.players.write().await;
            players.attach(record(2, 2), Duration::from_secs(1));
            players.get_mut(2).unwrap().updates = Some(SendChannel::with_base(0));
        }

        let mut sections = srv.sections.write().await;
        let mut players = srv.players.write().await;
        srv.broadcast_update(&mut sections, &mut players, 1, 1).await;

        let updates = players.get(2).unwrap().updates.as_ref().unwrap();
        assert_eq!(updates.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_store_ack_retires_section_stream() {
        let srv = test_server().await;
        {
            let mut sections = srv.sections.write().await;
            let mut section = section_with_ship(1, 1);
            section.store_out.register(1, b"v1".to_vec());
            section.store_out.register(2, b"v2".to_vec());
            sections.insert(1, section);
        }

        srv.handle_store_ack(1, 2).await;
        let sections = srv.sections.read().await;
        assert_eq!(sections.get(&1).unwrap().store_out.in_flight(), 0);
    }
}
