//! Walking the live world into saved records.
//!
//! Classification and naming decide where each entity lands in the archives
//! and under which identity it is matched again on load.

use parking_lot::Mutex;
use std::collections::HashMap;
use glam::Quat;
use keepsake_common::{Capabilities, EntityId, Transform, position_nearly_zero, tags};
use keepsake_kernel::{EntityRole, EntityView, WorldHost};

use crate::archive::{
    ComponentRecord, ControllerPayload, EntityKind, EntityPayload, PawnPayload, PlayerArchive,
    SavedEntityRecord, ScriptRecord,
};
use crate::codec::{ObjectCodec, TagSubject};
use crate::error::Result;
use crate::schema::SchemaRegistry;
use crate::settings::Settings;

/// Which side of the session a full reload resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReloadFlags {
    pub player: bool,
    pub level: bool,
}

/// Save/load category of a live entity.
pub fn classify(view: &EntityView) -> EntityKind {
    match view.role {
        EntityRole::Pawn {
            player_controlled: true,
        } if !view.has_tag(tags::PAWN_AS_LEVEL_ENTITY) => EntityKind::PlayerPawn,
        EntityRole::PlayerController | EntityRole::PlayerState => EntityKind::PlayerActor,
        EntityRole::LevelScript => EntityKind::LevelScript,
        EntityRole::ModeController | EntityRole::StateController => EntityKind::GameObject,
        _ if view.has_tag(tags::PERSISTENT) => EntityKind::Persistent,
        _ if view.placed => EntityKind::Placed,
        _ => EntityKind::Runtime,
    }
}

/// How identity names are derived from live names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamePolicy {
    partition_auto: bool,
    raw_names: bool,
}

impl NamePolicy {
    pub fn new(settings: &Settings) -> Self {
        Self {
            partition_auto: settings.partition_active() && settings.contains_streaming(),
            // Streaming composition always needs region-qualified names.
            raw_names: !settings.contains_streaming() && settings.simple_entity_names,
        }
    }

    /// The name an entity is saved and matched under.
    ///
    /// Placed entities are qualified with their region, `{region}_{name}`,
    /// unless the name already contains the region. Runtime entities always
    /// live in the persistent region and keep their name.
    pub fn full_name(&self, view: &EntityView) -> String {
        if self.partition_auto || self.raw_names || !view.placed || view.name.contains(&view.region) {
            return view.name.clone();
        }
        format!("{}_{}", view.region, view.name)
    }
}

/// Transform changes are allowed on movable, unattached entities that do not
/// opt out.
pub fn can_process_transform(view: &EntityView) -> bool {
    view.is_movable() && !view.has_tag(tags::SKIP_TRANSFORM) && !view.attached
}

/// A saved transform worth applying: finite and away from the origin.
pub fn has_valid_transform(transform: &Transform) -> bool {
    transform.is_valid() && !position_nearly_zero(transform.position)
}

fn is_player_entity(world: &dyn WorldHost, id: EntityId) -> bool {
    Some(id) == world.player_controller()
        || Some(id) == world.player_pawn()
        || Some(id) == world.player_state()
}

/// The entities one save or load pass works on, shared between concurrent
/// preparation calls. The lock covers list copies only.
#[derive(Debug, Default)]
pub struct Selection {
    ids: Mutex<Vec<EntityId>>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<EntityId> {
        self.ids.lock().clone()
    }

    pub fn replace(&self, ids: Vec<EntityId>) {
        *self.ids.lock() = ids;
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pick the entities a save (`loading == None`) or load pass should visit.
///
/// Skip-save entities are ignored. On a load, a full reload clears the
/// has-loaded marker of the reset side; otherwise placed entities that were
/// already loaded are left out. Level kinds are selected, plus the player
/// pawn on loads so a pawn saved as a level entity can be restored.
pub fn prepare_entities(
    world: &mut dyn WorldHost,
    settings: &Settings,
    schemas: &mut SchemaRegistry,
    loading: Option<(bool, ReloadFlags)>,
    selection: &Selection,
) -> usize {
    let mut selected = Vec::new();
    for id in world.entity_ids() {
        let Some(view) = world.entity(id) else {
            continue;
        };
        if view.has_tag(tags::SKIP_SAVE) {
            continue;
        }
        let kind = classify(&view);
        if let Some((full_reload, flags)) = loading {
            if full_reload {
                let reset = if is_player_entity(&*world, id) {
                    flags.player
                } else {
                    flags.level
                };
                if reset {
                    world.remove_tag(id, tags::HAS_LOADED);
                }
            } else if kind == EntityKind::Placed && view.has_tag(tags::HAS_LOADED) {
                continue;
            }
        }
        if settings.auto_save_structs {
            schemas.propagate(&view.class_path);
            for component in world.components(id) {
                schemas.propagate(&component.class_path);
            }
        }
        if kind.is_level_kind(true) || (loading.is_some() && kind == EntityKind::PlayerPawn) {
            selected.push(id);
        }
    }
    let count = selected.len();
    selection.replace(selected);
    tracing::debug!(count, loading = loading.is_some(), "prepared entity selection");
    count
}

/// Encodes entities, components and raw objects into payloads.
pub struct Capturer<'a> {
    pub codec: ObjectCodec,
    pub schemas: &'a SchemaRegistry,
    pub names: NamePolicy,
    pub raw_objects: &'a HashMap<EntityId, Vec<ComponentRecord>>,
}

impl Capturer<'_> {
    /// Encode one entity's fields and components, then mark it loaded so it
    /// is not loaded again without a full reload.
    pub fn payload(&self, world: &mut dyn WorldHost, id: EntityId, kind: EntityKind) -> Result<EntityPayload> {
        let Some(view) = world.entity(id) else {
            return Ok(EntityPayload::default());
        };
        let fields = world.fields(id).unwrap_or_default();
        let data = self
            .codec
            .encode(self.schemas, TagSubject::Entity(kind), &view.class_path, &fields)?;
        let mut components = Vec::new();
        if kind != EntityKind::LevelScript {
            for component in world.components(id) {
                if !component.capabilities.contains(Capabilities::SUPPORTS_PERSISTENCE)
                    || component.hosts_child_entity
                {
                    continue;
                }
                let bag = world.component_fields(id, &component.name).unwrap_or_default();
                components.push(ComponentRecord {
                    data: self
                        .codec
                        .encode(self.schemas, TagSubject::Component, &component.class_path, &bag)?,
                    name: component.name,
                    relative: component.relative,
                });
            }
        }
        if let Some(raw) = self.raw_objects.get(&id) {
            components.extend(raw.iter().cloned());
        }
        world.add_tag(id, tags::HAS_LOADED);
        Ok(EntityPayload { data, components })
    }

    pub fn record(&self, world: &mut dyn WorldHost, view: &EntityView, kind: EntityKind) -> Result<SavedEntityRecord> {
        let transform = if can_process_transform(view) {
            view.transform
        } else {
            Transform::IDENTITY
        };
        let mut record = SavedEntityRecord::new(self.names.full_name(view), kind, transform);
        if matches!(kind, EntityKind::Runtime | EntityKind::Persistent) {
            record.class_path = Some(view.class_path.clone());
        }
        record.payload = self.payload(world, view.id, kind)?;
        Ok(record)
    }
}

/// Everything a level save gathers from the live world.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelCapture {
    pub region: String,
    /// Runtime and placed entities, plus partition and destroyed records.
    pub entities: Vec<SavedEntityRecord>,
    pub persistent: Vec<SavedEntityRecord>,
    pub scripts: Vec<ScriptRecord>,
    pub mode: EntityPayload,
    pub state: EntityPayload,
}

impl Capturer<'_> {
    pub fn level(&self, world: &mut dyn WorldHost, selection: &[EntityId]) -> Result<LevelCapture> {
        let mut capture = LevelCapture {
            region: world.level_name().to_owned(),
            ..Default::default()
        };
        for &id in selection {
            let Some(view) = world.entity(id) else {
                continue;
            };
            if !view.supports_persistence() {
                continue;
            }
            match classify(&view) {
                kind @ (EntityKind::Runtime | EntityKind::Placed) => {
                    capture.entities.push(self.record(world, &view, kind)?);
                }
                EntityKind::Persistent => {
                    capture
                        .persistent
                        .push(self.record(world, &view, EntityKind::Persistent)?);
                }
                EntityKind::LevelScript => {
                    let payload = self.payload(world, id, EntityKind::LevelScript)?;
                    capture.scripts.push(ScriptRecord {
                        region: view.region.clone(),
                        payload,
                    });
                }
                _ => {}
            }
        }
        if let Some(id) = world.mode_controller() {
            capture.mode = self.game_object(world, id)?;
        }
        if let Some(id) = world.state_controller() {
            capture.state = self.game_object(world, id)?;
        }
        Ok(capture)
    }

    fn game_object(&self, world: &mut dyn WorldHost, id: EntityId) -> Result<EntityPayload> {
        match world.entity(id) {
            Some(view) if view.supports_persistence() => self.payload(world, id, EntityKind::GameObject),
            _ => Ok(EntityPayload::default()),
        }
    }

    /// Capture the local player. `None` when nothing player-side is saveable.
    pub fn player(&self, world: &mut dyn WorldHost) -> Result<Option<PlayerArchive>> {
        let mut archive = PlayerArchive {
            region: world.level_name().to_owned(),
            ..Default::default()
        };
        let mut any = false;

        if let Some(view) = world.player_controller().and_then(|id| world.entity(id)) {
            if view.supports_persistence() {
                let rotation = if view.has_tag(tags::SKIP_TRANSFORM) {
                    Quat::IDENTITY
                } else {
                    world.control_rotation().unwrap_or(Quat::IDENTITY)
                };
                archive.controller = ControllerPayload {
                    rotation,
                    payload: self.payload(world, view.id, EntityKind::PlayerActor)?,
                };
                any = true;
            }
        }

        if let Some(view) = world.player_pawn().and_then(|id| world.entity(id)) {
            if view.supports_persistence() && !view.has_tag(tags::PAWN_AS_LEVEL_ENTITY) {
                let mut pawn = PawnPayload::default();
                if !view.has_tag(tags::SKIP_TRANSFORM) {
                    pawn.position = view.transform.position;
                    pawn.rotation = view.transform.rotation;
                }
                pawn.payload = self.payload(world, view.id, EntityKind::PlayerPawn)?;
                archive.pawn = pawn;
                any = true;
            }
        }

        if let Some(view) = world.player_state().and_then(|id| world.entity(id)) {
            if view.supports_persistence() {
                archive.player_state = self.payload(world, view.id, EntityKind::PlayerActor)?;
                any = true;
            }
        }

        Ok(any.then_some(archive))
    }

    /// Placed entities of a region about to stream out.
    pub fn region_placed(&self, world: &mut dyn WorldHost, region: &str) -> Result<Vec<SavedEntityRecord>> {
        let mut records = Vec::new();
        for id in world.entity_ids() {
            let Some(view) = world.entity(id) else {
                continue;
            };
            if view.region != region
                || !view.supports_persistence()
                || view.has_tag(tags::SKIP_SAVE)
                || classify(&view) != EntityKind::Placed
            {
                continue;
            }
            records.push(self.record(world, &view, EntityKind::Placed)?);
        }
        Ok(records)
    }
}

/// Record remembering that a placed entity was destroyed.
pub fn destroyed_record(names: &NamePolicy, view: &EntityView) -> Option<SavedEntityRecord> {
    (view.supports_persistence() && !view.has_tag(tags::SKIP_SAVE) && classify(view) == EntityKind::Placed)
        .then(|| SavedEntityRecord::new(names.full_name(view), EntityKind::Destroyed, Transform::IDENTITY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use keepsake_common::Value;
    use keepsake_kernel::{ComponentTemplate, EntityTemplate, World};
    use crate::envelope::FormatVersion;
    use crate::schema::{FieldType, TypeSchema};
    use crate::settings::{MultiRegionMethod, WorldPartitionMethod};

    fn view(name: &str, region: &str, placed: bool, role: EntityRole) -> EntityView {
        EntityView {
            id: EntityId::new(),
            name: name.into(),
            class_path: "/Game/Thing".into(),
            role,
            placed,
            region: region.into(),
            tags: Default::default(),
            transform: Transform::IDENTITY,
            capabilities: Capabilities::SUPPORTS_PERSISTENCE | Capabilities::MOVABLE,
            attached: false,
        }
    }

    #[test]
    fn classification_precedence() {
        let mut pawn = view("Hero", "L", false, EntityRole::Pawn { player_controlled: true });
        assert_eq!(classify(&pawn), EntityKind::PlayerPawn);
        pawn.tags.insert(tags::PAWN_AS_LEVEL_ENTITY.into());
        assert_eq!(classify(&pawn), EntityKind::Runtime);

        assert_eq!(classify(&view("PC", "L", false, EntityRole::PlayerController)), EntityKind::PlayerActor);
        assert_eq!(classify(&view("S", "L", true, EntityRole::LevelScript)), EntityKind::LevelScript);
        assert_eq!(classify(&view("M", "L", false, EntityRole::ModeController)), EntityKind::GameObject);

        let mut keeper = view("Keeper", "L", true, EntityRole::Generic);
        assert_eq!(classify(&keeper), EntityKind::Placed);
        keeper.tags.insert(tags::PERSISTENT.into());
        assert_eq!(classify(&keeper), EntityKind::Persistent);
        assert_eq!(classify(&view("Bot", "L", false, EntityRole::Generic)), EntityKind::Runtime);
    }

    #[test]
    fn placed_names_are_region_qualified() {
        let full = NamePolicy::new(&Settings::default());
        let door = view("Door_12", "Level1", true, EntityRole::Generic);
        assert_eq!(full.full_name(&door), "Level1_Door_12");
        let already = view("Level1_Door_12", "Level1", true, EntityRole::Generic);
        assert_eq!(full.full_name(&already), "Level1_Door_12");
        let bot = view("Bot_3", "Level1", false, EntityRole::Generic);
        assert_eq!(full.full_name(&bot), "Bot_3");

        let simple = NamePolicy::new(&Settings {
            simple_entity_names: true,
            ..Settings::default()
        });
        assert_eq!(simple.full_name(&door), "Door_12");

        // Streaming overrides simple names.
        let streaming = NamePolicy::new(&Settings {
            simple_entity_names: true,
            multi_region: MultiRegionMethod::Streaming,
            ..Settings::default()
        });
        assert_eq!(streaming.full_name(&door), "Level1_Door_12");

        let partition = NamePolicy::new(&Settings {
            multi_region: MultiRegionMethod::Streaming,
            world_partition: WorldPartitionMethod::Enabled,
            ..Settings::default()
        });
        assert_eq!(partition.full_name(&door), "Door_12");
    }

    #[test]
    fn transform_guards() {
        let mut v = view("A", "L", true, EntityRole::Generic);
        assert!(can_process_transform(&v));
        v.attached = true;
        assert!(!can_process_transform(&v));
        v.attached = false;
        v.tags.insert(tags::SKIP_TRANSFORM.into());
        assert!(!can_process_transform(&v));

        assert!(!has_valid_transform(&Transform::IDENTITY));
        assert!(has_valid_transform(&Transform::from_position(Vec3::X)));
        let mut bad = Transform::from_position(Vec3::X);
        bad.scale = Vec3::ZERO;
        assert!(!has_valid_transform(&bad));
    }

    fn sample_world() -> World {
        let mut world = World::new("Level1");
        let door = EntityTemplate::new("/Game/Door").with_component(ComponentTemplate::new("Hinge", "/Game/Hinge"));
        let d = world.place(door, "Door_12", "Level1", Transform::from_position(Vec3::X)).unwrap();
        world.set_field(d, "Open", true);
        let bot = world
            .spawn(EntityTemplate::new("/Game/Bot"), "Bot_1", Transform::from_position(Vec3::Y))
            .unwrap();
        world.set_field(bot, "Health", 40);
        let mut skipped = EntityTemplate::new("/Game/Bot");
        skipped.tags.insert(tags::SKIP_SAVE.into());
        world.spawn(skipped, "Ghost", Transform::IDENTITY).unwrap();
        let mut keeper = EntityTemplate::new("/Game/Keeper");
        keeper.tags.insert(tags::PERSISTENT.into());
        world.spawn(keeper, "Keeper", Transform::from_position(Vec3::Z)).unwrap();
        let mut script = EntityTemplate::new("/Game/Script");
        script.role = EntityRole::LevelScript;
        world.place(script, "Script", "Level1", Transform::IDENTITY).unwrap();
        world
    }

    fn schemas() -> SchemaRegistry {
        let mut s = SchemaRegistry::new();
        s.register(TypeSchema::new("/Game/Door").persisted("Open", FieldType::Scalar));
        s.register(TypeSchema::new("/Game/Bot").persisted("Health", FieldType::Scalar));
        s.register(TypeSchema::new("/Game/Hinge").persisted("Angle", FieldType::Scalar));
        s
    }

    #[test]
    fn level_capture_sorts_entities_by_kind() {
        let settings = Settings::default();
        let mut world = sample_world();
        let mut schemas = schemas();
        let selection = Selection::new();
        prepare_entities(&mut world, &settings, &mut schemas, None, &selection);
        assert_eq!(selection.len(), 4);

        let raw = HashMap::new();
        let capturer = Capturer {
            codec: ObjectCodec::new(&settings, FormatVersion::CURRENT),
            schemas: &schemas,
            names: NamePolicy::new(&settings),
            raw_objects: &raw,
        };
        let capture = capturer.level(&mut world, &selection.snapshot()).unwrap();
        let mut names: Vec<_> = capture.entities.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["Bot_1", "Level1_Door_12"]);
        assert_eq!(capture.persistent.len(), 1);
        assert_eq!(capture.persistent[0].transform, Transform::IDENTITY);
        assert_eq!(capture.persistent[0].class_path.as_deref(), Some("/Game/Keeper"));
        assert_eq!(capture.scripts.len(), 1);
        assert_eq!(capture.scripts[0].region, "Level1");

        let door = capture.entities.iter().find(|r| r.kind == EntityKind::Placed).unwrap();
        assert!(door.class_path.is_none());
        assert_eq!(door.payload.components.len(), 1);
        let fields = capturer
            .codec
            .decode(TagSubject::Entity(EntityKind::Placed), &door.payload.data)
            .unwrap();
        assert_eq!(fields.get("Open"), Some(&Value::Bool(true)));

        // Saved entities are marked so an immediate load does not reapply.
        let id = world.id_of("Door_12").unwrap();
        assert!(world.entity(id).unwrap().has_tag(tags::HAS_LOADED));
    }

    #[test]
    fn load_preparation_skips_loaded_placed_unless_full_reload() {
        let settings = Settings::default();
        let mut world = sample_world();
        let mut schemas = schemas();
        let door = world.id_of("Door_12").unwrap();
        world.add_tag(door, tags::HAS_LOADED);
        let selection = Selection::new();

        prepare_entities(&mut world, &settings, &mut schemas, Some((false, ReloadFlags::default())), &selection);
        assert!(!selection.snapshot().contains(&door));

        let flags = ReloadFlags { player: false, level: true };
        prepare_entities(&mut world, &settings, &mut schemas, Some((true, flags)), &selection);
        assert!(selection.snapshot().contains(&door));
        assert!(!world.entity(door).unwrap().has_tag(tags::HAS_LOADED));
    }

    #[test]
    fn player_capture_honours_skip_transform() {
        let settings = Settings::default();
        let mut world = World::new("Level1");
        let mut pawn = EntityTemplate::new("/Game/Hero");
        pawn.role = EntityRole::Pawn { player_controlled: true };
        pawn.tags.insert(tags::SKIP_TRANSFORM.into());
        world.spawn(pawn, "Hero", Transform::from_position(Vec3::new(5.0, 0.0, 0.0))).unwrap();

        let schemas = SchemaRegistry::new();
        let raw = HashMap::new();
        let capturer = Capturer {
            codec: ObjectCodec::new(&settings, FormatVersion::CURRENT),
            schemas: &schemas,
            names: NamePolicy::new(&settings),
            raw_objects: &raw,
        };
        let archive = capturer.player(&mut world).unwrap().unwrap();
        assert_eq!(archive.pawn.position, Vec3::ZERO);
        assert_eq!(archive.region, "Level1");

        let mut empty = World::new("Level1");
        assert!(capturer.player(&mut empty).unwrap().is_none());
    }

    #[test]
    fn destroyed_records_only_for_placed() {
        let names = NamePolicy::new(&Settings::default());
        let door = view("Door_12", "Level1", true, EntityRole::Generic);
        let record = destroyed_record(&names, &door).unwrap();
        assert_eq!(record.kind, EntityKind::Destroyed);
        assert_eq!(record.name, "Level1_Door_12");
        assert!(destroyed_record(&names, &view("Bot", "Level1", false, EntityRole::Generic)).is_none());
    }
}
