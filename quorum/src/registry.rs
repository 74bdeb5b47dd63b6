//! Front registry, player table, section neighbor graph, and the
//! failover algorithm that moves a dead front's sections to a survivor.

use log::{info, warn};
use shared::config::ClusterConfig;
use shared::world::{FrontId, NeighborLinks, PlayerId, PlayerRecord, SectionId};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

/// Liveness and ownership state for one front.
#[derive(Debug, Clone)]
pub struct FrontEntry {
    pub id: FrontId,
    pub addr: SocketAddr,
    pub sections: HashSet<SectionId>,
    /// Consecutive heartbeats without a reply.
    pub missed: u32,
    pub failed: bool,
}

/// Coordination side effects the failover algorithm performs on fronts.
/// The network layer provides the TCP implementation; tests inject mocks.
pub trait FrontTransport {
    fn adopt_section(
        &self,
        front: SocketAddr,
        source: SocketAddr,
        section: SectionId,
        neighbors: NeighborLinks,
    ) -> impl std::future::Future<Output = bool> + Send;

    fn patch_neighbors(
        &self,
        front: SocketAddr,
        section: SectionId,
        neighbors: NeighborLinks,
    ) -> impl std::future::Future<Output = bool> + Send;

    fn attach_player(
        &self,
        front: SocketAddr,
        player: PlayerRecord,
    ) -> impl std::future::Future<Output = bool> + Send;
}

pub struct Registry {
    pub fronts: HashMap<FrontId, FrontEntry>,
    pub players: HashMap<PlayerId, PlayerRecord>,
    pub neighbors: HashMap<SectionId, NeighborLinks>,
}

impl Registry {
    pub fn from_config(config: &ClusterConfig) -> Self {
        let mut fronts: HashMap<FrontId, FrontEntry> = config
            .fronts
            .iter()
            .map(|seed| {
                (
                    seed.id,
                    FrontEntry {
                        id: seed.id,
                        addr: seed.addr,
                        sections: HashSet::new(),
                        missed: 0,
                        failed: false,
                    },
                )
            })
            .collect();

        let mut neighbors = HashMap::new();
        for section in &config.sections {
            neighbors.insert(section.id, section.neighbors.clone());
            if let Some(front) = fronts.get_mut(&section.front) {
                front.sections.insert(section.id);
            }
        }

        let players = config
            .players
            .iter()
            .map(|seed| {
                (
                    seed.id,
                    PlayerRecord {
                        id: seed.id,
                        name: seed.name.clone(),
                        session: String::new(),
                        front: seed.front,
                        section: seed.section,
                        addr: None,
                    },
                )
            })
            .collect();

        Self {
            fronts,
            players,
            neighbors,
        }
    }

    pub fn find_front_by_addr(&self, addr: SocketAddr) -> Option<FrontId> {
        self.fronts
            .values()
            .find(|front| front.addr == addr)
            .map(|front| front.id)
    }

    pub fn front_for_section(&self, section: SectionId) -> Option<FrontId> {
        self.fronts
            .values()
            .find(|front| front.sections.contains(&section))
            .map(|front| front.id)
    }

    /// Any heartbeat reply resets the counter and revives the front.
    pub fn record_pong(&mut self, addr: SocketAddr) {
        for front in self.fronts.values_mut() {
            if front.addr == addr {
                front.missed = 0;
                if front.failed {
                    front.failed = false;
                    info!("front {} back alive", front.id);
                }
            }
        }
    }

    /// Fronts that have reached the missed-heartbeat limit and are not
    /// yet marked failed; candidates for reassignment this cycle.
    pub fn overdue_fronts(&self, missed_limit: u32) -> Vec<FrontId> {
        let mut overdue: Vec<FrontId> = self
            .fronts
            .values()
            .filter(|front| !front.failed && front.missed >= missed_limit)
            .map(|front| front.id)
            .collect();
        overdue.sort_unstable();
        overdue
    }
}

/// Reassigns everything a dead front owned to a surviving front:
/// repairs the neighbor graph, migrates each section from its store
/// snapshot, pushes neighbor patches to adjacent sections on other
/// fronts, and repoints the orphaned players. The front is marked failed
/// only when every step succeeded; a partial failure leaves the failed
/// flag clear so the whole reassignment is retried on the next detection
/// cycle (idempotent, at-least-once).
pub async fn fail_front<T: FrontTransport>(
    registry: &mut Registry,
    failed_id: FrontId,
    store_addr: SocketAddr,
    missed_limit: u32,
    transport: &T,
) -> bool {
    info!("front {} failed, reassigning its sections", failed_id);

    let survivor = registry
        .fronts
        .values()
        .find(|front| front.id != failed_id && !front.failed)
        .map(|front| (front.id, front.addr));
    let Some((survivor_id, survivor_addr)) = survivor else {
        warn!("no available front to take over from front {}", failed_id);
        return false;
    };

    let mut sections: Vec<SectionId> = registry
        .fronts
        .get(&failed_id)
        .map(|front| front.sections.iter().copied().collect())
        .unwrap_or_default();
    sections.sort_unstable();

    info!(
        "moving sections {:?} from front {} to front {}",
        sections, failed_id, survivor_id
    );

    // Repair the neighbor graph first: every edge that pointed at a
    // migrated section now names the survivor's address.
    let mut touched: HashSet<SectionId> = HashSet::new();
    for &section in &sections {
        let edges: Vec<_> = registry
            .neighbors
            .get(&section)
            .map(|links| links.edges().collect())
            .unwrap_or_default();
        for (exit, (_addr, adjacent)) in edges {
            if let Some(links) = registry.neighbors.get_mut(&adjacent) {
                links.set(exit.opposite(), (survivor_addr, section));
                touched.insert(adjacent);
            }
        }
    }

    // Migrate each section to the survivor from its durable snapshot.
    for &section in &sections {
        let links = registry.neighbors.get(&section).cloned().unwrap_or_default();
        if !transport
            .adopt_section(survivor_addr, store_addr, section, links)
            .await
        {
            warn!(
                "front {} refused section {}; aborting reassignment for this cycle",
                survivor_id, section
            );
            return false;
        }
        if let Some(front) = registry.fronts.get_mut(&survivor_id) {
            front.sections.insert(section);
        }
        touched.remove(&section);
    }

    // Push neighbor patches to adjacent sections on other fronts. A
    // front that is itself overdue is skipped; its own failover carries
    // the repaired links.
    for &section in &touched {
        let Some(owner) = registry.front_for_section(section) else {
            warn!("no owner for adjacent section {}", section);
            continue;
        };
        let entry = &registry.fronts[&owner];
        if entry.missed >= missed_limit {
            info!(
                "not patching section {} on failing front {}",
                section, owner
            );
            continue;
        }
        let links = registry.neighbors.get(&section).cloned().unwrap_or_default();
        if !transport.patch_neighbors(entry.addr, section, links).await {
            warn!("patching neighbors for section {} failed", section);
            return false;
        }
    }

    // Orphaned players follow their sections to the survivor.
    for player in registry.players.values_mut() {
        if player.front == failed_id {
            info!("player {} to front {}", player.id, survivor_id);
            player.front = survivor_id;
        }
    }

    if let Some(front) = registry.fronts.get_mut(&failed_id) {
        front.sections.clear();
        front.failed = true;
    }
    info!("front {} marked failed", failed_id);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::world::Exit;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Adopt(SocketAddr, SectionId, NeighborLinks),
        Patch(SocketAddr, SectionId, NeighborLinks),
    }

    /// Records calls and answers from a scripted outcome list.
    struct MockTransport {
        calls: Mutex<Vec<Call>>,
        refuse_adopt: bool,
        refuse_patch: bool,
    }

    impl MockTransport {
        fn accepting() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                refuse_adopt: false,
                refuse_patch: false,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl FrontTransport for MockTransport {
        async fn adopt_section(
            &self,
            front: SocketAddr,
            _source: SocketAddr,
            section: SectionId,
            neighbors: NeighborLinks,
        ) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Adopt(front, section, neighbors));
            !self.refuse_adopt
        }

        async fn patch_neighbors(
            &self,
            front: SocketAddr,
            section: SectionId,
            neighbors: NeighborLinks,
        ) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Patch(front, section, neighbors));
            !self.refuse_patch
        }

        async fn attach_player(&self, _front: SocketAddr, _player: PlayerRecord) -> bool {
            true
        }
    }

    fn registry() -> Registry {
        Registry::from_config(&ClusterConfig::default())
    }

    fn store() -> SocketAddr {
        "127.0.0.1:10002".parse().unwrap()
    }

    #[test]
    fn test_registry_from_config() {
        let registry = registry();
        assert_eq!(registry.fronts.len(), 2);
        assert!(registry.fronts[&1].sections.contains(&1));
        assert!(registry.fronts[&2].sections.contains(&2));
        assert_eq!(registry.front_for_section(2), Some(2));
        assert_eq!(registry.players[&1].front, 1);
    }

    #[test]
    fn test_pong_revives_failed_front() {
        let mut registry = registry();
        let addr = registry.fronts[&1].addr;
        registry.fronts.get_mut(&1).unwrap().missed = 7;
        registry.fronts.get_mut(&1).unwrap().failed = true;

        registry.record_pong(addr);
        assert_eq!(registry.fronts[&1].missed, 0);
        assert!(!registry.fronts[&1].failed);
    }

    #[test]
    fn test_overdue_fronts_respects_limit_and_failed_flag() {
        let mut registry = registry();
        registry.fronts.get_mut(&1).unwrap().missed = 5;
        registry.fronts.get_mut(&2).unwrap().missed = 3;
        assert_eq!(registry.overdue_fronts(5), vec![1]);

        registry.fronts.get_mut(&1).unwrap().failed = true;
        assert!(registry.overdue_fronts(5).is_empty());
    }

    #[tokio::test]
    async fn test_fail_front_moves_sections_players_and_links() {
        let mut registry = registry();
        let survivor_addr = registry.fronts[&2].addr;
        let transport = MockTransport::accepting();

        assert!(fail_front(&mut registry, 1, store(), 5, &transport).await);

        // Section 1 now lives on front 2; front 1 owns nothing.
        assert!(registry.fronts[&1].failed);
        assert!(registry.fronts[&1].sections.is_empty());
        assert!(registry.fronts[&2].sections.contains(&1));
        assert!(registry.fronts[&2].sections.contains(&2));
        assert_eq!(registry.front_for_section(1), Some(2));

        // Section 2's west link now names the survivor's address.
        assert_eq!(
            registry.neighbors[&2].get(Exit::West),
            Some((survivor_addr, 1))
        );

        // Player 1 follows to the survivor.
        assert_eq!(registry.players[&1].front, 2);

        // One adoption for section 1, one patch for its east neighbor.
        let calls = transport.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, Call::Adopt(addr, 1, _) if *addr == survivor_addr)));
        assert!(calls
            .iter()
            .any(|c| matches!(c, Call::Patch(addr, 2, _) if *addr == survivor_addr)));
    }

    #[tokio::test]
    async fn test_failover_completeness_every_link_repaired() {
        let mut registry = registry();
        let survivor_addr = registry.fronts[&2].addr;
        let transport = MockTransport::accepting();
        fail_front(&mut registry, 1, store(), 5, &transport).await;

        let old_addr = registry.fronts[&1].addr;
        for links in registry.neighbors.values() {
            for (_, (addr, _)) in links.edges() {
                assert_ne!(addr, old_addr, "a link still names the failed front");
            }
        }
        assert_eq!(
            registry.neighbors[&2].get(Exit::West).unwrap().0,
            survivor_addr
        );
    }

    #[tokio::test]
    async fn test_refused_adoption_aborts_cycle() {
        let mut registry = registry();
        let transport = MockTransport {
            refuse_adopt: true,
            ..MockTransport::accepting()
        };

        assert!(!fail_front(&mut registry, 1, store(), 5, &transport).await);

        // Not marked failed: the next detection cycle retries the whole
        // reassignment.
        assert!(!registry.fronts[&1].failed);
        assert!(registry.fronts[&1].sections.contains(&1));
        assert_eq!(registry.players[&1].front, 1);
    }

    #[tokio::test]
    async fn test_refused_patch_aborts_cycle() {
        let mut registry = registry();
        let transport = MockTransport {
            refuse_patch: true,
            ..MockTransport::accepting()
        };

        assert!(!fail_front(&mut registry, 1, store(), 5, &transport).await);
        assert!(!registry.fronts[&1].failed);
    }

    #[tokio::test]
    async fn test_patch_skipped_for_failing_neighbor_front() {
        // Both fronts are overdue and front 2 fails first: section 1's
        // owner (front 1) is itself at the miss limit, so its neighbor
        // patch is skipped and left to front 1's own failover.
        let mut registry = registry();
        registry.fronts.get_mut(&1).unwrap().missed = 5;
        registry.fronts.get_mut(&2).unwrap().missed = 5;
        let transport = MockTransport::accepting();

        assert!(fail_front(&mut registry, 2, store(), 5, &transport).await);

        let calls = transport.calls();
        assert!(calls.iter().any(|c| matches!(c, Call::Adopt(_, 2, _))));
        assert!(
            !calls.iter().any(|c| matches!(c, Call::Patch(_, 1, _))),
            "patch must be skipped for a front that is itself failing"
        );
    }

    #[tokio::test]
    async fn test_no_survivor_available() {
        let mut registry = registry();
        registry.fronts.get_mut(&2).unwrap().failed = true;
        let transport = MockTransport::accepting();

        assert!(!fail_front(&mut registry, 1, store(), 5, &transport).await);
        assert!(!registry.fronts[&1].failed);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fail_front_is_idempotent_on_retry() {
        let mut registry = registry();
        let transport = MockTransport::accepting();
        assert!(fail_front(&mut registry, 1, store(), 5, &transport).await);

        // A second run (as after an aborted first cycle) converges to the
        // same ownership.
        registry.fronts.get_mut(&1).unwrap().failed = false;
        registry.fronts.get_mut(&1).unwrap().sections.insert(1);
        registry.fronts.get_mut(&2).unwrap().sections.remove(&1);
        assert!(fail_front(&mut registry, 1, store(), 5, &transport).await);
        assert!(registry.fronts[&2].sections.contains(&1));
        assert_eq!(registry.players[&1].front, 2);
    }
}
