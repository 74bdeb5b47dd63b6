//! World model: objects, motion integration, section geometry and
//! neighbor links, and the wire forms of sections and players.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

pub type ObjectId = u64;
pub type PlayerId = u64;
pub type SectionId = u64;
pub type FrontId = u32;

/// Coordinates are rounded to this many decimals on every integration so
/// that replayed motion produces identical positions everywhere.
pub const LOC_DECIMALS: i32 = 3;

/// A world object. Owned by exactly one section at a time; the section
/// tracks the version at which it was last written.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Object {
    pub name: String,
    /// Position within the owning section, origin at the section center.
    pub loc: (f64, f64),
    /// Units per second; zero means stationary.
    pub speed: f64,
    /// Heading in degrees, counter-clockwise from east.
    pub direction: f64,
}

impl Object {
    pub fn new(name: &str, loc: (f64, f64), speed: f64, direction: f64) -> Self {
        Self {
            name: name.to_string(),
            loc,
            speed,
            direction,
        }
    }
}

fn round_loc(v: f64) -> f64 {
    let factor = 10f64.powi(LOC_DECIMALS);
    (v * factor).round() / factor
}

/// Advances an object along its heading for the elapsed interval.
pub fn integrate(obj: &mut Object, elapsed: Duration) {
    if obj.speed <= 0.0 {
        return;
    }
    let dir = obj.direction.to_radians();
    let dt = elapsed.as_secs_f64();
    obj.loc = (
        round_loc(obj.loc.0 + dt * obj.speed * dir.cos()),
        round_loc(obj.loc.1 + dt * obj.speed * dir.sin()),
    );
}

/// Edge of a section an object has moved past.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    East,
    West,
    North,
    South,
}

impl Exit {
    pub fn opposite(self) -> Exit {
        match self {
            Exit::East => Exit::West,
            Exit::West => Exit::East,
            Exit::North => Exit::South,
            Exit::South => Exit::North,
        }
    }
}

/// Rectangular section extent, centered on the origin.
#[derive(Debug, Clone, Copy)]
pub struct SectionGeometry {
    pub width: f64,
    pub height: f64,
}

impl SectionGeometry {
    /// Reports which edge `loc` lies past, if any. East/west are tested
    /// before north/south and the first match wins, so a diagonal exit is
    /// resolved on one axis per tick.
    pub fn detect_exit(&self, loc: (f64, f64)) -> Option<Exit> {
        if loc.0 > self.width / 2.0 {
            Some(Exit::East)
        } else if loc.0 < -self.width / 2.0 {
            Some(Exit::West)
        } else if loc.1 > self.height / 2.0 {
            Some(Exit::North)
        } else if loc.1 < -self.height / 2.0 {
            Some(Exit::South)
        } else {
            None
        }
    }

    /// Folds an exited coordinate into the destination section's space.
    pub fn wrap(&self, exit: Exit, loc: (f64, f64)) -> (f64, f64) {
        match exit {
            Exit::East => (loc.0 - self.width, loc.1),
            Exit::West => (loc.0 + self.width, loc.1),
            Exit::North => (loc.0, loc.1 - self.height),
            Exit::South => (loc.0, loc.1 + self.height),
        }
    }

    /// Pins an exited coordinate to the boundary when there is no
    /// neighbor on that edge.
    pub fn clamp(&self, exit: Exit, loc: (f64, f64)) -> (f64, f64) {
        match exit {
            Exit::East => (self.width / 2.0, loc.1),
            Exit::West => (-self.width / 2.0, loc.1),
            Exit::North => (loc.0, self.height / 2.0),
            Exit::South => (loc.0, -self.height / 2.0),
        }
    }
}

/// Address of a neighboring section: the front that owns it and its id.
pub type NeighborRef = (SocketAddr, SectionId);

/// Per-edge links to adjacent sections. Absent edges are world boundary.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NeighborLinks {
    pub east: Option<NeighborRef>,
    pub west: Option<NeighborRef>,
    pub north: Option<NeighborRef>,
    pub south: Option<NeighborRef>,
}

impl NeighborLinks {
    pub fn get(&self, exit: Exit) -> Option<NeighborRef> {
        match exit {
            Exit::East => self.east,
            Exit::West => self.west,
            Exit::North => self.north,
            Exit::South => self.south,
        }
    }

    pub fn set(&mut self, exit: Exit, link: NeighborRef) {
        match exit {
            Exit::East => self.east = Some(link),
            Exit::West => self.west = Some(link),
            Exit::North => self.north = Some(link),
            Exit::South => self.south = Some(link),
        }
    }

    /// Applies a patch: only edges present in `patch` are overwritten.
    pub fn merge(&mut self, patch: &NeighborLinks) {
        for exit in [Exit::East, Exit::West, Exit::North, Exit::South] {
            if let Some(link) = patch.get(exit) {
                self.set(exit, link);
            }
        }
    }

    pub fn edges(&self) -> impl Iterator<Item = (Exit, NeighborRef)> + '_ {
        [Exit::East, Exit::West, Exit::North, Exit::South]
            .into_iter()
            .filter_map(|e| self.get(e).map(|l| (e, l)))
    }
}

/// Wire form of a section: live objects only, no tombstones and no
/// channel state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SectionSnapshot {
    pub id: SectionId,
    pub name: String,
    pub version: u64,
    pub objects: HashMap<ObjectId, Object>,
}

/// Wire form of a player, stripped of reliable-channel state. `addr` is
/// the player's datagram endpoint as last seen by quorum.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub name: String,
    pub session: String,
    pub front: FrontId,
    pub section: SectionId,
    pub addr: Option<SocketAddr>,
}
