//! Ordered application of per-section update streams and snapshot state.

use log::{debug, info, warn};
use shared::channel::RecvChannel;
use shared::world::{FrontId, Object, ObjectId, SectionId, SectionSnapshot};
use std::collections::HashMap;
use std::net::SocketAddr;

/// One section held by the store: the snapshot plus the inbound stream
/// state and the identity of the front allowed to write it.
pub struct StoredSection {
    pub snapshot: SectionSnapshot,
    pub owner_id: FrontId,
    pub owner_addr: SocketAddr,
    inbound: RecvChannel<(ObjectId, Option<Object>)>,
}

impl StoredSection {
    pub fn new(snapshot: SectionSnapshot, owner_id: FrontId, owner_addr: SocketAddr) -> Self {
        let base = snapshot.version;
        Self {
            snapshot,
            owner_id,
            owner_addr,
            inbound: RecvChannel::with_base(base),
        }
    }

    pub fn applied_version(&self) -> u64 {
        self.inbound.cumulative_ack()
    }
}

#[derive(Default)]
pub struct Replica {
    sections: HashMap<SectionId, StoredSection>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a snapshot and registers its owning front, resetting the
    /// inbound stream at the snapshot version. Called at seeding time and
    /// whenever a front (re-)takes ownership of a section.
    pub fn register(
        &mut self,
        section_id: SectionId,
        snapshot: SectionSnapshot,
        owner_id: FrontId,
        owner_addr: SocketAddr,
    ) {
        info!(
            "storing section {} at version {} for front {}",
            section_id, snapshot.version, owner_id
        );
        self.sections
            .insert(section_id, StoredSection::new(snapshot, owner_id, owner_addr));
    }

    /// Applies one update from the stream. Returns the cumulative applied
    /// version to acknowledge, or `None` when the update must not be
    /// acknowledged: unknown section, or a sender that is not the
    /// registered owner (stale-owner protection during handoff/failover).
    pub fn apply_update(
        &mut self,
        from: SocketAddr,
        section_id: SectionId,
        version: u64,
        object_id: ObjectId,
        object: Option<Object>,
    ) -> Option<u64> {
        let section = match self.sections.get_mut(&section_id) {
            Some(section) => section,
            None => {
                debug!("update for unknown section {}", section_id);
                return None;
            }
        };
        if from != section.owner_addr {
            warn!(
                "rejecting update for section {} from {}: owner is front {} at {}",
                section_id, from, section.owner_id, section.owner_addr
            );
            return None;
        }

        for (applied_version, (id, obj)) in section.inbound.accept(version, (object_id, object)) {
            section.snapshot.version = applied_version;
            match obj {
                Some(obj) => {
                    debug!(
                        "updating object {} in section {} ver {}",
                        id, section_id, applied_version
                    );
                    section.snapshot.objects.insert(id, obj);
                }
                None => {
                    debug!(
                        "removing object {} from section {} ver {}",
                        id, section_id, applied_version
                    );
                    section.snapshot.objects.remove(&id);
                }
            }
        }
        Some(section.applied_version())
    }

    pub fn fetch(&self, section_id: SectionId) -> Option<SectionSnapshot> {
        self.sections.get(&section_id).map(|s| s.snapshot.clone())
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
