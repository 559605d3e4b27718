use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use keepsake_common::{Capabilities, EntityId, FieldBag, Transform, Value};

use crate::host::{
    ComponentTemplate, ComponentView, EntityRole, EntityTemplate, EntityView, SpawnError,
    WorldHost,
};

/// An event record produced by mutations of the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorldEvent {
    /// Entity was created, either authored or spawned at runtime.
    Spawned { id: EntityId, name: String },
    /// Entity was destroyed. Carries its last view so observers can react
    /// after the fact.
    Destroyed { view: EntityView },
    /// Entity transform was updated.
    TransformUpdated {
        id: EntityId,
        old: Transform,
        new: Transform,
    },
    /// Fields were merged into an entity or one of its components.
    FieldsApplied { id: EntityId },
    /// A streaming sub-region finished loading or unloading.
    RegionChanged { region: String, loaded: bool },
    /// Simulation advanced one tick.
    Stepped { tick: u64, time: f64 },
}

/// In-memory live entity graph.
///
/// Serves as the reference [`WorldHost`]: the CLI drives it and the save
/// engine's tests use it as their runtime. Uses BTreeMap for deterministic
/// iteration order across all platforms.
#[derive(Debug, Clone, Default)]
pub struct World {
    level_name: String,
    entities: BTreeMap<EntityId, EntityData>,
    names: BTreeMap<String, EntityId>,
    loaded_regions: BTreeSet<String>,
    paused: bool,
    authority: bool,
    viewer: Option<Vec3>,
    control_rotation: Quat,
    tick: u64,
    time: f64,
    /// Append-only event log of all mutations.
    event_log: Vec<WorldEvent>,
}

/// Per-entity data stored in the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub name: String,
    pub class_path: String,
    pub role: EntityRole,
    pub placed: bool,
    pub region: String,
    pub tags: BTreeSet<String>,
    pub transform: Transform,
    pub capabilities: Capabilities,
    pub parent: Option<EntityId>,
    pub fields: FieldBag,
    pub components: Vec<ComponentData>,
}

/// Per-component data stored on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentData {
    pub name: String,
    pub class_path: String,
    pub relative: Transform,
    pub capabilities: Capabilities,
    pub hosts_child_entity: bool,
    pub fields: FieldBag,
}

impl From<ComponentTemplate> for ComponentData {
    fn from(t: ComponentTemplate) -> Self {
        Self {
            name: t.name,
            class_path: t.class_path,
            relative: t.relative,
            capabilities: t.capabilities,
            hosts_child_entity: false,
            fields: t.fields,
        }
    }
}

impl World {
    /// Create an empty, authoritative world running in `level_name`.
    pub fn new(level_name: impl Into<String>) -> Self {
        Self {
            level_name: level_name.into(),
            authority: true,
            control_rotation: Quat::IDENTITY,
            ..Default::default()
        }
    }

    /// Current simulation tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Number of entities in the world.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Read-only access to the event log.
    pub fn events(&self) -> &[WorldEvent] {
        &self.event_log
    }

    /// Read-only access to all entities (BTreeMap for deterministic iteration).
    pub fn entities(&self) -> &BTreeMap<EntityId, EntityData> {
        &self.entities
    }

    /// Get a reference to entity data.
    pub fn get(&self, id: EntityId) -> Option<&EntityData> {
        self.entities.get(&id)
    }

    /// Get a mutable reference to entity data. Name changes through this
    /// reference are not reflected in the name index.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityData> {
        self.entities.get_mut(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<EntityId> {
        self.names.get(name).copied()
    }

    pub fn field(&self, id: EntityId, name: &str) -> Option<&Value> {
        self.entities.get(&id)?.fields.get(name)
    }

    pub fn set_field(&mut self, id: EntityId, name: &str, value: impl Into<Value>) -> bool {
        match self.entities.get_mut(&id) {
            Some(data) => {
                data.fields.insert(name.to_owned(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn set_level_name(&mut self, name: impl Into<String>) {
        self.level_name = name.into();
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn set_authority(&mut self, authority: bool) {
        self.authority = authority;
    }

    pub fn set_viewer(&mut self, location: Option<Vec3>) {
        self.viewer = location;
    }

    /// Author an entity into `region`, as a level designer would.
    pub fn place(
        &mut self,
        template: EntityTemplate,
        name: &str,
        region: &str,
        transform: Transform,
    ) -> Result<EntityId, SpawnError> {
        let id = self.insert(template, name, transform)?;
        if let Some(data) = self.entities.get_mut(&id) {
            data.placed = true;
            data.region = region.to_owned();
        }
        Ok(id)
    }

    /// Attach `child` to `parent`. Both must be alive.
    pub fn attach(&mut self, child: EntityId, parent: EntityId) -> bool {
        if !self.entities.contains_key(&parent) {
            return false;
        }
        match self.entities.get_mut(&child) {
            Some(data) => {
                data.parent = Some(parent);
                true
            }
            None => false,
        }
    }

    pub fn load_region(&mut self, region: &str) {
        if self.loaded_regions.insert(region.to_owned()) {
            self.event_log.push(WorldEvent::RegionChanged {
                region: region.to_owned(),
                loaded: true,
            });
        }
    }

    /// Stream out a sub-region, removing every entity authored into it.
    /// Streaming out is not destruction, so no `Destroyed` events are logged.
    pub fn unload_region(&mut self, region: &str) -> Vec<EntityData> {
        let doomed: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, d)| d.region == region)
            .map(|(id, _)| *id)
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(data) = self.entities.remove(&id) {
                self.names.remove(&data.name);
                removed.push(data);
            }
        }
        if self.loaded_regions.remove(region) {
            self.event_log.push(WorldEvent::RegionChanged {
                region: region.to_owned(),
                loaded: false,
            });
        }
        tracing::debug!(region, entities = removed.len(), "region streamed out");
        removed
    }

    /// Advance the simulation by one tick of `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        self.tick += 1;
        self.time += dt;
        self.event_log.push(WorldEvent::Stepped {
            tick: self.tick,
            time: self.time,
        });
    }

    /// Compute a deterministic hash of the world state for comparison.
    ///
    /// Entities are visited in name order, not id order, so two worlds that
    /// reached the same state through different spawn orders hash equally.
    pub fn state_hash(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325; // FNV offset basis
        let mix = |h: &mut u64, bytes: &[u8]| {
            for &b in bytes {
                *h ^= b as u64;
                *h = h.wrapping_mul(0x0100_0000_01b3);
            }
        };
        for (name, id) in &self.names {
            let Some(data) = self.entities.get(id) else {
                continue;
            };
            mix(&mut h, name.as_bytes());
            mix(&mut h, data.class_path.as_bytes());
            for v in data.transform.position.to_array() {
                mix(&mut h, &v.to_le_bytes());
            }
            for v in data.transform.rotation.to_array() {
                mix(&mut h, &v.to_le_bytes());
            }
            for tag in &data.tags {
                mix(&mut h, tag.as_bytes());
            }
            mix(&mut h, format!("{:?}", data.fields).as_bytes());
            for c in &data.components {
                mix(&mut h, c.name.as_bytes());
                mix(&mut h, format!("{:?}", c.fields).as_bytes());
            }
        }
        h
    }

    fn insert(
        &mut self,
        template: EntityTemplate,
        name: &str,
        transform: Transform,
    ) -> Result<EntityId, SpawnError> {
        if name.is_empty() {
            return Err(SpawnError::EmptyName);
        }
        if self.names.contains_key(name) {
            tracing::debug!(entity = name, "spawn rejected, name taken");
            return Err(SpawnError::DuplicateName(name.to_owned()));
        }
        if template.class_path.is_empty() {
            return Err(SpawnError::NotInstantiable(name.to_owned()));
        }
        let id = EntityId::new();
        let data = EntityData {
            name: name.to_owned(),
            class_path: template.class_path,
            role: template.role,
            placed: false,
            region: self.level_name.clone(),
            tags: template.tags,
            transform,
            capabilities: template.capabilities,
            parent: None,
            fields: template.fields,
            components: template.components.into_iter().map(Into::into).collect(),
        };
        self.entities.insert(id, data);
        self.names.insert(name.to_owned(), id);
        self.event_log.push(WorldEvent::Spawned {
            id,
            name: name.to_owned(),
        });
        Ok(id)
    }

    fn view(&self, id: EntityId, data: &EntityData) -> EntityView {
        EntityView {
            id,
            name: data.name.clone(),
            class_path: data.class_path.clone(),
            role: data.role,
            placed: data.placed,
            region: data.region.clone(),
            tags: data.tags.clone(),
            transform: data.transform,
            capabilities: data.capabilities,
            attached: data
                .parent
                .is_some_and(|parent| self.entities.contains_key(&parent)),
        }
    }

    fn first_with_role(&self, pred: impl Fn(EntityRole) -> bool) -> Option<EntityId> {
        self.entities
            .iter()
            .find(|(_, d)| pred(d.role))
            .map(|(id, _)| *id)
    }
}

impl WorldHost for World {
    fn level_name(&self) -> &str {
        &self.level_name
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn has_authority(&self) -> bool {
        self.authority
    }

    fn viewer_location(&self) -> Option<Vec3> {
        self.viewer
    }

    fn time_seconds(&self) -> f64 {
        self.time
    }

    fn loaded_regions(&self) -> Vec<String> {
        self.loaded_regions.iter().cloned().collect()
    }

    fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    fn entity(&self, id: EntityId) -> Option<EntityView> {
        self.entities.get(&id).map(|d| self.view(id, d))
    }

    fn find_by_name(&self, name: &str) -> Option<EntityId> {
        self.id_of(name)
    }

    fn fields(&self, id: EntityId) -> Option<FieldBag> {
        self.entities.get(&id).map(|d| d.fields.clone())
    }

    fn apply_fields(&mut self, id: EntityId, fields: FieldBag) -> bool {
        let Some(data) = self.entities.get_mut(&id) else {
            return false;
        };
        data.fields.extend(fields);
        self.event_log.push(WorldEvent::FieldsApplied { id });
        true
    }

    fn components(&self, id: EntityId) -> Vec<ComponentView> {
        self.entities
            .get(&id)
            .map(|d| {
                d.components
                    .iter()
                    .map(|c| ComponentView {
                        name: c.name.clone(),
                        class_path: c.class_path.clone(),
                        relative: c.relative,
                        capabilities: c.capabilities,
                        hosts_child_entity: c.hosts_child_entity,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn component_fields(&self, id: EntityId, component: &str) -> Option<FieldBag> {
        self.entities
            .get(&id)?
            .components
            .iter()
            .find(|c| c.name == component)
            .map(|c| c.fields.clone())
    }

    fn apply_component(
        &mut self,
        id: EntityId,
        component: &str,
        relative: Option<Transform>,
        fields: FieldBag,
    ) -> bool {
        let Some(data) = self.entities.get_mut(&id) else {
            return false;
        };
        let Some(c) = data.components.iter_mut().find(|c| c.name == component) else {
            return false;
        };
        if let Some(relative) = relative {
            c.relative = relative;
        }
        c.fields.extend(fields);
        self.event_log.push(WorldEvent::FieldsApplied { id });
        true
    }

    fn set_transform(&mut self, id: EntityId, new: Transform) -> bool {
        if let Some(data) = self.entities.get_mut(&id) {
            let old = data.transform;
            data.transform = new;
            self.event_log
                .push(WorldEvent::TransformUpdated { id, old, new });
            true
        } else {
            false
        }
    }

    fn add_tag(&mut self, id: EntityId, tag: &str) -> bool {
        match self.entities.get_mut(&id) {
            Some(data) => {
                data.tags.insert(tag.to_owned());
                true
            }
            None => false,
        }
    }

    fn remove_tag(&mut self, id: EntityId, tag: &str) -> bool {
        match self.entities.get_mut(&id) {
            Some(data) => data.tags.remove(tag),
            None => false,
        }
    }

    fn spawn(
        &mut self,
        template: EntityTemplate,
        name: &str,
        transform: Transform,
    ) -> Result<EntityId, SpawnError> {
        self.insert(template, name, transform)
    }

    fn destroy(&mut self, id: EntityId) -> bool {
        let Some(data) = self.entities.get(&id) else {
            return false;
        };
        let view = self.view(id, data);
        self.entities.remove(&id);
        self.names.remove(&view.name);
        tracing::trace!(entity = %view.name, "destroyed");
        self.event_log.push(WorldEvent::Destroyed { view });
        true
    }

    fn player_controller(&self) -> Option<EntityId> {
        self.first_with_role(|r| r == EntityRole::PlayerController)
    }

    fn player_pawn(&self) -> Option<EntityId> {
        self.first_with_role(|r| {
            matches!(
                r,
                EntityRole::Pawn {
                    player_controlled: true
                }
            )
        })
    }

    fn player_state(&self) -> Option<EntityId> {
        self.first_with_role(|r| r == EntityRole::PlayerState)
    }

    fn mode_controller(&self) -> Option<EntityId> {
        self.first_with_role(|r| r == EntityRole::ModeController)
    }

    fn state_controller(&self) -> Option<EntityId> {
        self.first_with_role(|r| r == EntityRole::StateController)
    }

    fn control_rotation(&self) -> Option<Quat> {
        self.player_controller().map(|_| self.control_rotation)
    }

    fn set_control_rotation(&mut self, rotation: Quat) -> bool {
        if self.player_controller().is_none() {
            return false;
        }
        self.control_rotation = rotation;
        true
    }

    fn participant_names(&self) -> Vec<String> {
        self.entities
            .values()
            .filter(|d| d.role == EntityRole::PlayerState)
            .map(|d| match d.fields.get("PlayerName").and_then(Value::as_text) {
                Some(display) => display.to_owned(),
                None => d.name.clone(),
            })
            .collect()
    }

    fn drain_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.event_log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crate_template() -> EntityTemplate {
        EntityTemplate::new("/Game/Props/Crate")
    }

    #[test]
    fn world_starts_empty() {
        let w = World::new("Level1");
        assert_eq!(w.tick(), 0);
        assert_eq!(w.entity_count(), 0);
        assert_eq!(w.level_name(), "Level1");
        assert!(w.has_authority());
    }

    #[test]
    fn spawn_and_destroy() {
        let mut w = World::new("Level1");
        let id = w
            .spawn(crate_template(), "Crate_1", Transform::default())
            .unwrap();
        assert_eq!(w.entity_count(), 1);
        assert_eq!(w.find_by_name("Crate_1"), Some(id));

        assert!(w.destroy(id));
        assert_eq!(w.entity_count(), 0);
        assert!(w.find_by_name("Crate_1").is_none());
        assert!(!w.is_alive(id));
        assert!(!w.destroy(id));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut w = World::new("Level1");
        w.spawn(crate_template(), "Crate_1", Transform::default())
            .unwrap();
        let err = w
            .spawn(crate_template(), "Crate_1", Transform::default())
            .unwrap_err();
        assert!(matches!(err, SpawnError::DuplicateName(_)));
        assert!(matches!(
            w.spawn(crate_template(), "", Transform::default()),
            Err(SpawnError::EmptyName)
        ));
    }

    #[test]
    fn placed_entities_keep_their_region() {
        let mut w = World::new("Level1");
        let id = w
            .place(crate_template(), "Door_12", "SubA", Transform::default())
            .unwrap();
        let view = w.entity(id).unwrap();
        assert!(view.placed);
        assert_eq!(view.region, "SubA");
    }

    #[test]
    fn destroy_logs_last_view() {
        let mut w = World::new("Level1");
        let id = w
            .place(crate_template(), "Door_12", "Level1", Transform::default())
            .unwrap();
        w.drain_events();
        w.destroy(id);
        let events = w.drain_events();
        assert!(matches!(
            &events[..],
            [WorldEvent::Destroyed { view }] if view.name == "Door_12" && view.placed
        ));
    }

    #[test]
    fn unload_region_removes_entities_silently() {
        let mut w = World::new("Level1");
        w.load_region("SubA");
        w.place(crate_template(), "A_1", "SubA", Transform::default())
            .unwrap();
        w.place(crate_template(), "B_1", "SubB", Transform::default())
            .unwrap();
        let removed = w.unload_region("SubA");
        assert_eq!(removed.len(), 1);
        assert_eq!(w.entity_count(), 1);
        assert!(w.loaded_regions().is_empty());
        assert!(
            !w.events()
                .iter()
                .any(|e| matches!(e, WorldEvent::Destroyed { .. }))
        );
    }

    #[test]
    fn apply_fields_merges() {
        let mut w = World::new("Level1");
        let id = w
            .spawn(crate_template(), "Crate_1", Transform::default())
            .unwrap();
        w.set_field(id, "Health", 10);
        let mut incoming = FieldBag::new();
        incoming.insert("Ammo".into(), Value::Int(3));
        assert!(w.apply_fields(id, incoming));
        assert_eq!(w.field(id, "Health"), Some(&Value::Int(10)));
        assert_eq!(w.field(id, "Ammo"), Some(&Value::Int(3)));
    }

    #[test]
    fn components_are_addressed_by_name() {
        let mut w = World::new("Level1");
        let template = crate_template().with_component(ComponentTemplate::new(
            "Inventory",
            "/Script/Inventory",
        ));
        let id = w.spawn(template, "Crate_1", Transform::default()).unwrap();
        let mut fields = FieldBag::new();
        fields.insert("Slots".into(), Value::Int(4));
        let moved = Transform::from_position(Vec3::Y);
        assert!(w.apply_component(id, "Inventory", Some(moved), fields));
        assert!(!w.apply_component(id, "Missing", None, FieldBag::new()));
        assert_eq!(w.components(id)[0].relative, moved);
        assert_eq!(
            w.component_fields(id, "Inventory").unwrap().get("Slots"),
            Some(&Value::Int(4))
        );
    }

    #[test]
    fn player_roles_are_discoverable() {
        let mut w = World::new("Level1");
        assert!(w.control_rotation().is_none());
        let mut controller = EntityTemplate::new("/Script/PlayerController");
        controller.role = EntityRole::PlayerController;
        w.spawn(controller, "PC_0", Transform::default()).unwrap();
        let mut state = EntityTemplate::new("/Script/PlayerState");
        state.role = EntityRole::PlayerState;
        state.fields.insert("PlayerName".into(), Value::from("Ada"));
        w.spawn(state, "PS_0", Transform::default()).unwrap();

        assert!(w.player_controller().is_some());
        assert!(w.player_pawn().is_none());
        assert!(w.set_control_rotation(Quat::from_rotation_z(1.0)));
        assert_eq!(w.participant_names(), vec!["Ada".to_owned()]);
    }

    #[test]
    fn attached_flag_follows_parent_liveness() {
        let mut w = World::new("Level1");
        let parent = w
            .spawn(crate_template(), "Parent", Transform::default())
            .unwrap();
        let child = w
            .spawn(crate_template(), "Child", Transform::default())
            .unwrap();
        assert!(w.attach(child, parent));
        assert!(w.entity(child).unwrap().attached);
        w.destroy(parent);
        assert!(!w.entity(child).unwrap().attached);
    }

    #[test]
    fn state_hash_ignores_spawn_order() {
        let mut w1 = World::new("Level1");
        let mut w2 = World::new("Level1");
        w1.spawn(crate_template(), "A", Transform::default()).unwrap();
        w1.spawn(crate_template(), "B", Transform::default()).unwrap();
        w2.spawn(crate_template(), "B", Transform::default()).unwrap();
        w2.spawn(crate_template(), "A", Transform::default()).unwrap();
        assert_eq!(w1.state_hash(), w2.state_hash());

        let id = w2.id_of("A").unwrap();
        w2.set_field(id, "Health", 1);
        assert_ne!(w1.state_hash(), w2.state_hash());
    }

    #[test]
    fn step_advances_time() {
        let mut w = World::new("Level1");
        w.step(0.5);
        w.step(0.5);
        assert_eq!(w.tick(), 2);
        assert!((w.time_seconds() - 1.0).abs() < f64::EPSILON);
    }
}
