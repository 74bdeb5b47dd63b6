//! Cross-section and cross-front handoff: the state machine that moves
//! an object (and its controlling player, when attached) over a boundary
//! without ever leaving ownership ambiguous. Quorum confirms every move
//! before any visible state change; a refused or unreachable destination
//! leaves the object in the source section to be retried next tick.

use crate::network::FrontServer;
use crate::players::PlayerTable;
use crate::world::{Crossing, Section, Tracked};
use log::{info, warn};
use shared::coord::{self, Request, Response};
use shared::protocol::{self, Datagram};
use shared::world::{Object, ObjectId, PlayerRecord, SectionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

impl FrontServer {
    /// Resolves one boundary crossing detected by the tick. Whatever the
    /// outcome, the source section commits the motion afterwards: a
    /// tombstone on success, the out-of-bounds position on failure so
    /// the crossing retries.
    pub(crate) async fn resolve_crossing(
        &self,
        sections: &mut HashMap<SectionId, Section>,
        players: &mut PlayerTable,
        source: SectionId,
        crossing: Crossing,
    ) {
        let Crossing {
            object_id,
            dest_front,
            dest_section,
            object,
        } = crossing;

        if dest_front == self.addr {
            self.move_within_front(sections, players, source, dest_section, object_id, object)
                .await;
        } else {
            self.move_to_front(
                sections,
                players,
                source,
                dest_front,
                dest_section,
                object_id,
                object,
            )
            .await;
        }

        self.broadcast_update(sections, players, source, object_id)
            .await;
    }

    /// Destination section lives on this front: quorum confirms, then
    /// the object is tombstoned at the source and inserted at the
    /// destination in one locked step.
    async fn move_within_front(
        &self,
        sections: &mut HashMap<SectionId, Section>,
        players: &mut PlayerTable,
        source: SectionId,
        dest_section: SectionId,
        object_id: ObjectId,
        object: Object,
    ) {
        info!(
            "moving object {} from section {} to section {}",
            object_id, source, dest_section
        );
        if !sections.contains_key(&dest_section) {
            warn!("destination section {} is not owned here", dest_section);
            return;
        }

        let confirm = coord::try_call(
            self.config.quorum_addr,
            &Request::ConfirmMove {
                object_id,
                front: self.addr,
                section: dest_section,
            },
            self.config.call_timeout,
        )
        .await;
        if !matches!(confirm, Response::Ok) {
            warn!("quorum refused move of object {}", object_id);
            return;
        }

        if let Some(section) = sections.get_mut(&source) {
            section.objects.insert(object_id, None);
        }
        if let Some(section) = sections.get_mut(&dest_section) {
            section
                .objects
                .insert(object_id, Some(Tracked::arriving(object, Instant::now())));
        }
        self.broadcast_update(sections, players, dest_section, object_id)
            .await;

        // A connected player follows their ship: same front, new section,
        // fresh sequence space.
        if let Some(link) = players.get_mut(object_id) {
            link.record.section = dest_section;
            let _ = protocol::send_datagram(
                &self.socket,
                &Datagram::Redirect { front: self.addr },
                link.addr,
                0,
            )
            .await;
            link.reset_link(self.config.player_initial_rtt);
        }
    }

    /// Destination section lives on another front: push the object (and
    /// player) there; only a confirmed transfer tombstones locally.
    async fn move_to_front(
        &self,
        sections: &mut HashMap<SectionId, Section>,
        players: &mut PlayerTable,
        source: SectionId,
        dest_front: SocketAddr,
        dest_section: SectionId,
        object_id: ObjectId,
        object: Object,
    ) {
        info!(
            "transferring object {} to front {} section {}",
            object_id, dest_front, dest_section
        );

        let player = players.get(object_id).map(|link| {
            let mut record = link.record.clone();
            record.section = dest_section;
            record.addr = Some(link.addr);
            record
        });

        let response = coord::try_call(
            dest_front,
            &Request::TransferObject {
                object_id,
                object,
                section: dest_section,
                player,
            },
            self.config.call_timeout,
        )
        .await;
        if !matches!(response, Response::Ok) {
            warn!(
                "transfer of object {} to {} failed, retrying next tick",
                object_id, dest_front
            );
            return;
        }

        if let Some(section) = sections.get_mut(&source) {
            section.objects.insert(object_id, None);
        }
        if let Some(link) = players.remove(object_id) {
            let _ = protocol::send_datagram(
                &self.socket,
                &Datagram::Redirect { front: dest_front },
                link.addr,
                0,
            )
            .await;
        }
    }

    /// Inbound side of a cross-front transfer. Quorum must confirm the
    /// new `(object, front, section)` ownership before the object becomes
    /// visible here; otherwise the caller keeps it and retries.
    pub(crate) async fn accept_transfer(
        &self,
        object_id: ObjectId,
        object: Object,
        section_id: SectionId,
        player: Option<PlayerRecord>,
    ) -> Response {
        info!("receiving object {}", object_id);
        let mut sections = self.sections.write().await;
        let mut players = self.players.write().await;

        if !sections.contains_key(&section_id) {
            warn!("transfer names section {} we do not own", section_id);
            return Response::NotFound;
        }

        let confirm = coord::try_call(
            self.config.quorum_addr,
            &Request::ConfirmMove {
                object_id,
                front: self.addr,
                section: section_id,
            },
            self.config.call_timeout,
        )
        .await;
        if !matches!(confirm, Response::Ok) {
            warn!("quorum refused inbound transfer of object {}", object_id);
            return Response::Unavailable;
        }

        if let Some(section) = sections.get_mut(&section_id) {
            section
                .objects
                .insert(object_id, Some(Tracked::arriving(object, Instant::now())));
        }
        if let Some(mut record) = player {
            record.front = self.id;
            record.section = section_id;
            players.attach(record, self.config.player_initial_rtt);
        }
        self.broadcast_update(&mut sections, &mut players, section_id, object_id)
            .await;

        info!("received object {}", object_id);
        Response::Ok
    }
}
