//! Section state owned by a front: versioned object maps, motion
//! ticking, boundary handling, and gameplay command application.

use log::debug;
use shared::channel::SendChannel;
use shared::protocol::Command;
use shared::world::{
    integrate, NeighborLinks, Object, ObjectId, SectionGeometry, SectionId, SectionSnapshot,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// An object plus the runtime state that never leaves this front.
#[derive(Debug, Clone)]
pub struct Tracked {
    pub object: Object,
    /// When motion was last integrated; `None` while stationary.
    pub last_move: Option<Instant>,
}

impl Tracked {
    pub fn arriving(object: Object, now: Instant) -> Self {
        Self {
            object,
            last_move: Some(now),
        }
    }
}

/// A map section held by this front. `None` in the object map is a
/// tombstone left behind by a transfer; snapshots drop them.
pub struct Section {
    pub id: SectionId,
    pub name: String,
    /// Strictly increases by 1 on every committed mutation.
    pub version: u64,
    pub objects: HashMap<ObjectId, Option<Tracked>>,
    pub neighbors: NeighborLinks,
    /// Outbound reliable channel to the store, keyed by version.
    pub store_out: SendChannel<Vec<u8>>,
}

impl Section {
    pub fn from_snapshot(snapshot: SectionSnapshot, neighbors: NeighborLinks) -> Self {
        let store_out = SendChannel::with_base(snapshot.version);
        Self {
            id: snapshot.id,
            name: snapshot.name,
            version: snapshot.version,
            objects: snapshot
                .objects
                .into_iter()
                .map(|(id, object)| {
                    (
                        id,
                        Some(Tracked {
                            object,
                            last_move: None,
                        }),
                    )
                })
                .collect(),
            neighbors,
            store_out,
        }
    }

    /// Wire form: live objects only, runtime state stripped.
    pub fn snapshot(&self) -> SectionSnapshot {
        SectionSnapshot {
            id: self.id,
            name: self.name.clone(),
            version: self.version,
            objects: self
                .objects
                .iter()
                .filter_map(|(id, slot)| slot.as_ref().map(|t| (*id, t.object.clone())))
                .collect(),
        }
    }

    /// Commits one mutation: bumps the version and returns it together
    /// with the object's current wire state (`None` for a tombstone).
    /// The caller broadcasts exactly this pair.
    pub fn commit(&mut self, object_id: ObjectId) -> (u64, Option<Object>) {
        self.version += 1;
        let object = self
            .objects
            .get(&object_id)
            .and_then(|slot| slot.as_ref())
            .map(|t| t.object.clone());
        (self.version, object)
    }

    pub fn live_object_mut(&mut self, id: ObjectId) -> Option<&mut Tracked> {
        self.objects.get_mut(&id).and_then(|slot| slot.as_mut())
    }
}

/// An object that moved past an edge with a neighbor behind it; carries
/// the object's state already translated into the destination's space.
#[derive(Debug, Clone)]
pub struct Crossing {
    pub object_id: ObjectId,
    pub dest_front: SocketAddr,
    pub dest_section: SectionId,
    pub object: Object,
}

#[derive(Debug, Default)]
pub struct TickResult {
    /// Objects that moved (or clamped) in place; each needs a commit.
    pub moved: Vec<ObjectId>,
    /// Objects that exited toward a neighbor; the handoff machinery
    /// commits these after resolution.
    pub crossings: Vec<Crossing>,
}

/// Integrates every moving object in the section and classifies the
/// results. Boundary edges without a neighbor clamp; edges with one
/// produce a [`Crossing`]. The crossed object keeps its out-of-bounds
/// position here so a failed handoff retries naturally on the next tick.
pub fn tick_section(section: &mut Section, geometry: &SectionGeometry, now: Instant) -> TickResult {
    let mut result = TickResult::default();
    let ids: Vec<ObjectId> = section.objects.keys().copied().collect();

    for id in ids {
        let Some(Some(tracked)) = section.objects.get_mut(&id) else {
            continue;
        };
        if tracked.object.speed <= 0.0 {
            continue;
        }
        let elapsed = tracked
            .last_move
            .map(|at| now.duration_since(at))
            .unwrap_or_default();
        integrate(&mut tracked.object, elapsed);
        tracked.last_move = Some(now);

        match geometry.detect_exit(tracked.object.loc) {
            None => result.moved.push(id),
            Some(exit) => match section.neighbors.get(exit) {
                None => {
                    tracked.object.loc = geometry.clamp(exit, tracked.object.loc);
                    result.moved.push(id);
                }
                Some((dest_front, dest_section)) => {
                    let mut object = tracked.object.clone();
                    object.loc = geometry.wrap(exit, object.loc);
                    result.crossings.push(Crossing {
                        object_id: id,
                        dest_front,
                        dest_section,
                        object,
                    });
                }
            },
        }
    }
    result
}

/// Applies a gameplay command to a player's own object. Pending motion
/// is integrated first so a stale command acts on the up-to-date
/// position.
pub fn apply_command(tracked: &mut Tracked, command: Command, now: Instant) {
    if tracked.object.speed > 0.0 {
        if let Some(at) = tracked.last_move {
            integrate(&mut tracked.object, now.duration_since(at));
        }
        tracked.last_move = Some(now);
    }

    match command {
        Command::Nop => debug!("NOP for {}", tracked.object.name),
        Command::SetSpeed(speed) => {
            if tracked.object.speed == 0.0 && speed > 0 {
                tracked.last_move = Some(now);
            }
            tracked.object.speed = f64::from(speed);
            if speed == 0 {
                tracked.last_move = None;
                debug!("{} stopped", tracked.object.name);
            } else {
                debug!("{} changed speed to {}", tracked.object.name, speed);
            }
        }
        Command::SetDirection(direction) => {
            tracked.object.direction = f64::from(direction);
            debug!("{} changed direction to {}", tracked.object.name, direction);
        }
    }
}
