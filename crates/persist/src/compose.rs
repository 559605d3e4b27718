//! Multi-region composition of level and player bodies.
//!
//! The body of a level unit is a single [`RegionArchive`] unless the
//! configured method is stack based, in which case it is a [`RegionStack`].
//! The body of a player unit is a [`PlayerArchive`] or, stack based, a
//! [`PlayerStack`]. Bodies are CBOR.
//!
//! # Invariants
//! - The region memory only ever holds real regions; the persistent region
//!   is rebuilt from the live world on every save.
//! - Runtime records are pruned from the streaming aggregate before the
//!   current region is folded in, so stale runtime entities never respawn.

use glam::{Quat, Vec3};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::archive::{
    EntityKind, EntityPayload, PlayerArchive, PlayerStack, RegionArchive, RegionStack,
    SavedEntityRecord, ScriptRecord, replace_or_push_archive,
};
use crate::capture::LevelCapture;
use crate::error::{ArchiveKind, PersistError, Result};
use crate::session::{PERSISTENT_REGION, RegionMemory};
use crate::settings::{MultiRegionMethod, Settings};

pub(crate) fn to_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| PersistError::Encode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn from_body<T: DeserializeOwned>(body: &[u8], kind: ArchiveKind) -> Result<T> {
    ciborium::from_reader(body).map_err(|e| PersistError::malformed(kind, e))
}

/// Build a stack from the current level, the other regions in memory and
/// the persistent region, then remember the current level.
fn add_to_stack(
    memory: &mut RegionMemory,
    level: &RegionArchive,
    persistent: &RegionArchive,
    mode: EntityPayload,
    state: EntityPayload,
) -> RegionStack {
    let mut stack = RegionStack {
        archives: vec![level.clone()],
        mode,
        state,
    };
    for archive in &memory.stack {
        if archive.region != level.region && archive.region != persistent.region {
            stack.archives.push(archive.clone());
        }
    }
    replace_or_push_archive(&mut memory.stack, level);
    stack.archives.push(persistent.clone());
    stack
}

/// Fold the level into the streaming aggregate and return it populated with
/// the aggregate's records.
fn add_to_stream(memory: &mut RegionMemory, level: &RegionArchive) -> RegionArchive {
    let mut aggregate = memory.aggregate.clone();
    let pruned = aggregate.prune_runtime();
    aggregate.merge(level);
    tracing::trace!(pruned, entities = aggregate.entities.len(), "streaming aggregate updated");
    let mut out = level.clone();
    out.entities = aggregate.entities;
    out.scripts = aggregate.scripts;
    memory.aggregate.copy_from(&out);
    out
}

/// Compose a level body from a capture.
pub fn compose_level(settings: &Settings, memory: &mut RegionMemory, capture: LevelCapture) -> Result<Vec<u8>> {
    let stacked = settings.is_stack_based();
    let mut level = RegionArchive {
        entities: capture.entities,
        scripts: capture.scripts,
        region: capture.region,
        ..Default::default()
    };
    if !stacked {
        // Without a stack the level archive carries mode, state and the
        // persistent entities itself.
        level.mode = capture.mode.clone();
        level.state = capture.state.clone();
        level.entities.extend(capture.persistent.iter().cloned());
    }
    let mut persistent = RegionArchive::new(PERSISTENT_REGION);
    if stacked {
        persistent.entities = capture.persistent;
    }

    match settings.multi_region {
        MultiRegionMethod::Disabled => to_body(&level),
        MultiRegionMethod::Basic => {
            let stack = add_to_stack(memory, &level, &persistent, capture.mode, capture.state);
            to_body(&stack)
        }
        MultiRegionMethod::Streaming => {
            let streamed = add_to_stream(memory, &level);
            to_body(&streamed)
        }
        MultiRegionMethod::Full => {
            let streamed = add_to_stream(memory, &level);
            let stack = add_to_stack(memory, &streamed, &persistent, capture.mode, capture.state);
            to_body(&stack)
        }
    }
}

/// What a level load hands to reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelContent {
    pub entities: Vec<SavedEntityRecord>,
    pub scripts: Vec<ScriptRecord>,
    pub mode: EntityPayload,
    pub state: EntityPayload,
    /// Anything in the archive applied to the active region.
    pub accepted: bool,
}

impl LevelContent {
    /// Take the records of `archive` that apply to `level`.
    fn unpack(&mut self, settings: &Settings, archive: &RegionArchive, level: &str) {
        let same_region = archive.region == level;
        for record in &archive.entities {
            if record.kind == EntityKind::Persistent || same_region {
                self.entities.push(record.clone());
                self.accepted = true;
            }
        }
        if same_region {
            self.scripts.extend(archive.scripts.iter().cloned());
            self.accepted = true;
        }
        // Stacks keep mode and state at the top level.
        if !settings.is_stack_based() && (same_region || settings.persistent_game_mode) {
            self.mode = archive.mode.clone();
            self.state = archive.state.clone();
            self.accepted = true;
        }
    }
}

/// Decompose a level body for the active `level`.
pub fn decompose_level(
    settings: &Settings,
    memory: &mut RegionMemory,
    level: &str,
    body: &[u8],
) -> Result<LevelContent> {
    let mut content = LevelContent::default();
    if settings.is_stack_based() {
        let stack: RegionStack = from_body(body, ArchiveKind::Level)?;
        if memory.stack.is_empty() {
            memory.stack = stack
                .archives
                .iter()
                .filter(|a| a.region != PERSISTENT_REGION)
                .cloned()
                .collect();
        }
        for archive in &stack.archives {
            if archive.region == level {
                if settings.multi_region == MultiRegionMethod::Full {
                    memory.aggregate.copy_from(archive);
                }
                content.unpack(settings, archive, level);
            } else if archive.region == PERSISTENT_REGION {
                content.unpack(settings, archive, level);
            }
        }
        content.mode = stack.mode;
        content.state = stack.state;
        content.accepted = true;
    } else {
        let archive: RegionArchive = from_body(body, ArchiveKind::Level)?;
        if settings.contains_streaming() {
            memory.aggregate.copy_from(&archive);
        }
        content.unpack(settings, &archive, level);
    }
    tracing::debug!(
        level,
        entities = content.entities.len(),
        scripts = content.scripts.len(),
        accepted = content.accepted,
        "level archive decomposed"
    );
    Ok(content)
}

/// Compose a player body.
pub fn compose_player(settings: &Settings, memory: &mut RegionMemory, archive: &PlayerArchive) -> Result<Vec<u8>> {
    if settings.is_stack_based() {
        memory.player.record(archive);
        to_body(&memory.player)
    } else {
        to_body(archive)
    }
}

/// Decompose a player body for the active `level`. `None` when the saved
/// player belongs to another region and does not persist across regions.
pub fn decompose_player(
    settings: &Settings,
    memory: &mut RegionMemory,
    level: &str,
    body: &[u8],
) -> Result<Option<PlayerArchive>> {
    if settings.is_stack_based() {
        let stack: PlayerStack = from_body(body, ArchiveKind::Player)?;
        if memory.player.is_empty() {
            memory.player = stack.clone();
        }
        let mut player = stack.player;
        match stack.positions.get(level) {
            Some(snapshot) => {
                player.pawn.position = snapshot.position;
                player.pawn.rotation = snapshot.rotation;
                player.controller.rotation = snapshot.control_rotation;
            }
            None => {
                // An unvisited region must not inherit another region's spot.
                player.pawn.position = Vec3::ZERO;
                player.pawn.rotation = Quat::IDENTITY;
                player.controller.rotation = Quat::IDENTITY;
            }
        }
        return Ok(Some(player));
    }
    let archive: PlayerArchive = from_body(body, ArchiveKind::Player)?;
    if archive.region == level || settings.persistent_player {
        Ok(Some(archive))
    } else {
        tracing::debug!(saved = %archive.region, level, "player saved in another region, skipped");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepsake_common::Transform;

    fn settings(multi_region: MultiRegionMethod) -> Settings {
        Settings {
            multi_region,
            ..Settings::default()
        }
    }

    fn record(name: &str, kind: EntityKind) -> SavedEntityRecord {
        SavedEntityRecord::new(name, kind, Transform::from_position(Vec3::X))
    }

    fn capture(region: &str, entities: &[(&str, EntityKind)]) -> LevelCapture {
        LevelCapture {
            region: region.into(),
            entities: entities.iter().map(|(n, k)| record(n, *k)).collect(),
            persistent: vec![record("Keeper", EntityKind::Persistent)],
            scripts: vec![ScriptRecord {
                region: region.into(),
                payload: EntityPayload::default(),
            }],
            mode: EntityPayload {
                data: vec![1],
                components: vec![],
            },
            state: EntityPayload::default(),
        }
    }

    fn names(records: &[SavedEntityRecord]) -> Vec<&str> {
        let mut v: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        v.sort();
        v
    }

    #[test]
    fn disabled_round_trips_one_region() {
        let s = settings(MultiRegionMethod::Disabled);
        let mut memory = RegionMemory::default();
        let body = compose_level(&s, &mut memory, capture("A", &[("A_Door", EntityKind::Placed)])).unwrap();
        assert!(memory.is_empty());

        let here = decompose_level(&s, &mut memory, "A", &body).unwrap();
        assert_eq!(names(&here.entities), vec!["A_Door", "Keeper"]);
        assert_eq!(here.mode.data, vec![1]);
        assert_eq!(here.scripts.len(), 1);

        // Elsewhere only persistent records apply.
        let there = decompose_level(&s, &mut memory, "B", &body).unwrap();
        assert_eq!(names(&there.entities), vec!["Keeper"]);
        assert!(there.scripts.is_empty());
        assert!(there.mode.data.is_empty());
    }

    #[test]
    fn persistent_game_mode_crosses_regions() {
        let s = Settings {
            persistent_game_mode: true,
            ..settings(MultiRegionMethod::Disabled)
        };
        let mut memory = RegionMemory::default();
        let body = compose_level(&s, &mut memory, capture("A", &[])).unwrap();
        let there = decompose_level(&s, &mut memory, "B", &body).unwrap();
        assert_eq!(there.mode.data, vec![1]);
    }

    #[test]
    fn basic_stack_keeps_every_visited_region() {
        let s = settings(MultiRegionMethod::Basic);
        let mut memory = RegionMemory::default();
        compose_level(&s, &mut memory, capture("A", &[("A_Door", EntityKind::Placed)])).unwrap();
        let body = compose_level(&s, &mut memory, capture("B", &[("B_Gate", EntityKind::Placed)])).unwrap();
        assert_eq!(memory.stack.len(), 2);

        let stack: RegionStack = from_body(&body, ArchiveKind::Level).unwrap();
        let regions: Vec<_> = stack.archives.iter().map(|a| a.region.as_str()).collect();
        assert_eq!(regions, vec!["B", "A", PERSISTENT_REGION]);
        assert_eq!(stack.mode.data, vec![1]);

        let mut fresh = RegionMemory::default();
        let a = decompose_level(&s, &mut fresh, "A", &body).unwrap();
        assert_eq!(names(&a.entities), vec!["A_Door", "Keeper"]);
        assert_eq!(fresh.stack.len(), 2);
        assert_eq!(a.mode.data, vec![1]);
    }

    #[test]
    fn restacking_a_region_replaces_it() {
        let s = settings(MultiRegionMethod::Basic);
        let mut memory = RegionMemory::default();
        compose_level(&s, &mut memory, capture("A", &[("A_Old", EntityKind::Placed)])).unwrap();
        compose_level(&s, &mut memory, capture("A", &[("A_New", EntityKind::Placed)])).unwrap();
        assert_eq!(memory.stack.len(), 1);
        assert_eq!(names(&memory.stack[0].entities), vec!["A_New"]);
    }

    #[test]
    fn streaming_prunes_runtime_but_keeps_placed() {
        let s = settings(MultiRegionMethod::Streaming);
        let mut memory = RegionMemory::default();
        compose_level(
            &s,
            &mut memory,
            capture("A", &[("A_Door", EntityKind::Placed), ("Bot", EntityKind::Runtime)]),
        )
        .unwrap();
        assert_eq!(memory.aggregate.entities.len(), 3);

        // Region A streams out; the next save no longer sees its entities.
        let body = compose_level(&s, &mut memory, capture("A", &[])).unwrap();
        let archive: RegionArchive = from_body(&body, ArchiveKind::Level).unwrap();
        assert_eq!(names(&archive.entities), vec!["A_Door", "Keeper"]);

        let content = decompose_level(&s, &mut RegionMemory::default(), "A", &body).unwrap();
        assert!(content.entities.iter().all(|r| r.kind != EntityKind::Runtime));
        assert!(content.entities.iter().any(|r| r.name == "A_Door"));
    }

    #[test]
    fn full_folds_stream_into_stack() {
        let s = settings(MultiRegionMethod::Full);
        let mut memory = RegionMemory::default();
        compose_level(&s, &mut memory, capture("A", &[("A_Door", EntityKind::Placed)])).unwrap();
        let body = compose_level(&s, &mut memory, capture("B", &[("B_Gate", EntityKind::Placed)])).unwrap();
        let stack: RegionStack = from_body(&body, ArchiveKind::Level).unwrap();
        let b = stack.find("B").unwrap();
        assert_eq!(names(&b.entities), vec!["A_Door", "B_Gate"]);
        let persistent = stack.find(PERSISTENT_REGION).unwrap();
        assert_eq!(names(&persistent.entities), vec!["Keeper"]);
    }

    #[test]
    fn player_stack_restores_per_region_position() {
        let s = settings(MultiRegionMethod::Basic);
        let mut memory = RegionMemory::default();
        let mut archive = PlayerArchive {
            region: "A".into(),
            ..Default::default()
        };
        archive.pawn.position = Vec3::new(1.0, 2.0, 3.0);
        compose_player(&s, &mut memory, &archive).unwrap();
        archive.region = "B".into();
        archive.pawn.position = Vec3::new(9.0, 9.0, 9.0);
        let body = compose_player(&s, &mut memory, &archive).unwrap();

        let mut fresh = RegionMemory::default();
        let a = decompose_player(&s, &mut fresh, "A", &body).unwrap().unwrap();
        assert_eq!(a.pawn.position, Vec3::new(1.0, 2.0, 3.0));
        let c = decompose_player(&s, &mut fresh, "C", &body).unwrap().unwrap();
        assert_eq!(c.pawn.position, Vec3::ZERO);
        assert_eq!(fresh.player.positions.len(), 2);
    }

    #[test]
    fn single_player_archive_is_region_bound() {
        let s = settings(MultiRegionMethod::Disabled);
        let mut memory = RegionMemory::default();
        let archive = PlayerArchive {
            region: "A".into(),
            ..Default::default()
        };
        let body = compose_player(&s, &mut memory, &archive).unwrap();
        assert!(decompose_player(&s, &mut memory, "A", &body).unwrap().is_some());
        assert!(decompose_player(&s, &mut memory, "B", &body).unwrap().is_none());

        let roaming = Settings {
            persistent_player: true,
            ..s
        };
        assert!(decompose_player(&roaming, &mut memory, "B", &body).unwrap().is_some());
    }

    #[test]
    fn garbage_body_is_malformed() {
        let s = settings(MultiRegionMethod::Disabled);
        let err = decompose_level(&s, &mut RegionMemory::default(), "A", &[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, PersistError::MalformedArchive { kind: ArchiveKind::Level, .. }));
    }
}
