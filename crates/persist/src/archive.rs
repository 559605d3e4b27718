//! Serialized shapes of the player, level and slot archives.
//!
//! # Invariants
//! - Record identity is the identity name; replace-or-append never merges.
//! - Persistent-kind records always carry the identity transform.
//! - Region archives are keyed by region identity name.

use chrono::{DateTime, Utc};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use keepsake_common::Transform;

/// Suffix marking a component record that holds a raw (non-entity) object.
pub const RAW_OBJECT_SUFFIX: &str = "@raw";

/// How an entity takes part in save/load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Spawned at runtime; restored by spawning from its class path.
    Runtime,
    /// Authored into a region; restored in place.
    Placed,
    LevelScript,
    PlayerActor,
    PlayerPawn,
    GameObject,
    /// Survives across regions.
    Persistent,
    /// A placed entity that was destroyed and must stay destroyed.
    Destroyed,
}

impl EntityKind {
    /// Kinds saved with the level. Scripts only count when asked for.
    pub fn is_level_kind(self, include_scripts: bool) -> bool {
        match self {
            EntityKind::Runtime
            | EntityKind::Placed
            | EntityKind::Persistent
            | EntityKind::Destroyed => true,
            EntityKind::LevelScript => include_scripts,
            EntityKind::PlayerActor | EntityKind::PlayerPawn | EntityKind::GameObject => false,
        }
    }

    pub fn is_player_kind(self) -> bool {
        matches!(self, EntityKind::PlayerActor | EntityKind::PlayerPawn)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub name: String,
    pub relative: Transform,
    pub data: Vec<u8>,
}

impl ComponentRecord {
    pub fn is_raw_object(&self) -> bool {
        self.name.ends_with(RAW_OBJECT_SUFFIX)
    }
}

/// Encoded fields of one entity plus its components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub data: Vec<u8>,
    pub components: Vec<ComponentRecord>,
}

impl EntityPayload {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.components.is_empty()
    }

    pub fn raw_object(&self, id: &str) -> Option<&ComponentRecord> {
        let key = raw_object_key(id);
        self.components.iter().find(|c| c.name == key)
    }
}

pub fn raw_object_key(id: &str) -> String {
    format!("{id}{RAW_OBJECT_SUFFIX}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedEntityRecord {
    /// Only set for entities restored by spawning.
    pub class_path: Option<String>,
    pub name: String,
    pub transform: Transform,
    pub kind: EntityKind,
    pub payload: EntityPayload,
}

impl SavedEntityRecord {
    pub fn new(name: impl Into<String>, kind: EntityKind, transform: Transform) -> Self {
        let transform = if kind == EntityKind::Persistent {
            Transform::IDENTITY
        } else {
            transform
        };
        Self {
            class_path: None,
            name: name.into(),
            transform,
            kind,
            payload: EntityPayload::default(),
        }
    }

    pub fn same_identity(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Per-region script payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub region: String,
    pub payload: EntityPayload,
}

/// Replace the entry with the same identity, or append.
pub fn replace_or_push_entity(list: &mut Vec<SavedEntityRecord>, record: SavedEntityRecord) {
    match list.iter_mut().find(|r| r.same_identity(&record)) {
        Some(slot) => *slot = record,
        None => list.push(record),
    }
}

pub fn replace_or_push_script(list: &mut Vec<ScriptRecord>, record: ScriptRecord) {
    match list.iter_mut().find(|r| r.region == record.region) {
        Some(slot) => *slot = record,
        None => list.push(record),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionArchive {
    pub entities: Vec<SavedEntityRecord>,
    pub scripts: Vec<ScriptRecord>,
    pub mode: EntityPayload,
    pub state: EntityPayload,
    pub region: String,
}

impl RegionArchive {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Default::default()
        }
    }

    /// Take over `other`'s content wholesale. The region identity is kept.
    pub fn replace_with(&mut self, other: &RegionArchive) {
        self.entities = other.entities.clone();
        self.scripts = other.scripts.clone();
        self.mode = other.mode.clone();
        self.state = other.state.clone();
    }
}

/// One archive per visited region plus the shared mode/state pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionStack {
    pub archives: Vec<RegionArchive>,
    pub mode: EntityPayload,
    pub state: EntityPayload,
}

impl RegionStack {
    pub fn find(&self, region: &str) -> Option<&RegionArchive> {
        self.archives.iter().find(|a| a.region == region)
    }
}

/// Replace the archive with the same region identity, or append.
pub fn replace_or_push_archive(list: &mut Vec<RegionArchive>, archive: &RegionArchive) {
    match list.iter_mut().find(|a| a.region == archive.region) {
        Some(existing) => existing.replace_with(archive),
        None => list.push(archive.clone()),
    }
}

/// Union of entity and script records across every region seen this session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingAggregate {
    pub entities: Vec<SavedEntityRecord>,
    pub scripts: Vec<ScriptRecord>,
}

impl StreamingAggregate {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.scripts.is_empty()
    }

    /// Drop runtime records; they are re-captured from the live world or
    /// gone for good.
    pub fn prune_runtime(&mut self) -> usize {
        let before = self.entities.len();
        self.entities.retain(|r| r.kind != EntityKind::Runtime);
        before - self.entities.len()
    }

    pub fn merge(&mut self, archive: &RegionArchive) {
        for record in &archive.entities {
            replace_or_push_entity(&mut self.entities, record.clone());
        }
        for script in &archive.scripts {
            replace_or_push_script(&mut self.scripts, script.clone());
        }
    }

    pub fn copy_from(&mut self, archive: &RegionArchive) {
        self.entities = archive.entities.clone();
        self.scripts = archive.scripts.clone();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerPayload {
    pub rotation: Quat,
    pub payload: EntityPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PawnPayload {
    pub position: Vec3,
    pub rotation: Quat,
    pub payload: EntityPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerArchive {
    pub controller: ControllerPayload,
    pub pawn: PawnPayload,
    pub player_state: EntityPayload,
    pub region: String,
}

/// Where the player stood when last in a region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub position: Vec3,
    pub rotation: Quat,
    pub control_rotation: Quat,
}

impl PositionSnapshot {
    pub fn of(archive: &PlayerArchive) -> Self {
        Self {
            position: archive.pawn.position,
            rotation: archive.pawn.rotation,
            control_rotation: archive.controller.rotation,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerStack {
    pub player: PlayerArchive,
    pub positions: BTreeMap<String, PositionSnapshot>,
}

impl PlayerStack {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Take over the latest player payload and remember its position under
    /// its region.
    pub fn record(&mut self, archive: &PlayerArchive) {
        self.positions
            .insert(archive.region.clone(), PositionSnapshot::of(archive));
        self.player = archive.clone();
    }
}

/// Discovery and sorting metadata for a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfoRecord {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub region: String,
    pub players: Vec<String>,
}
