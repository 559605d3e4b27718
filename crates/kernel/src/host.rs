//! The contract between the save engine and whatever owns the live entities.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use keepsake_common::{Capabilities, EntityId, FieldBag, Transform};

use crate::world::WorldEvent;

/// What part an entity plays in the world. Drives save classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntityRole {
    #[default]
    Generic,
    /// A possessable body. `player_controlled` is true while a local player drives it.
    Pawn { player_controlled: bool },
    PlayerController,
    PlayerState,
    /// Per-region script object; at most one per region.
    LevelScript,
    /// Rules object for the session (game mode equivalent).
    ModeController,
    /// Replicated session state (game state equivalent).
    StateController,
}

/// Read-only snapshot of a live entity's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub id: EntityId,
    pub name: String,
    pub class_path: String,
    pub role: EntityRole,
    /// Authored into a region rather than spawned at runtime.
    pub placed: bool,
    pub region: String,
    pub tags: BTreeSet<String>,
    pub transform: Transform,
    pub capabilities: Capabilities,
    /// Attached to a parent entity; attached entities follow their parent.
    pub attached: bool,
}

impl EntityView {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn supports_persistence(&self) -> bool {
        self.capabilities.contains(Capabilities::SUPPORTS_PERSISTENCE)
    }

    pub fn is_movable(&self) -> bool {
        self.capabilities.contains(Capabilities::MOVABLE)
    }
}

/// Read-only snapshot of one component on a live entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentView {
    pub name: String,
    pub class_path: String,
    pub relative: Transform,
    pub capabilities: Capabilities,
    /// Wraps a child entity; the child is saved on its own.
    pub hosts_child_entity: bool,
}

/// Blueprint for a component created along with an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentTemplate {
    pub name: String,
    pub class_path: String,
    pub relative: Transform,
    pub capabilities: Capabilities,
    pub fields: FieldBag,
}

impl ComponentTemplate {
    pub fn new(name: impl Into<String>, class_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_path: class_path.into(),
            relative: Transform::IDENTITY,
            capabilities: Capabilities::SUPPORTS_PERSISTENCE,
            fields: FieldBag::new(),
        }
    }
}

/// Blueprint handed to [`WorldHost::spawn`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTemplate {
    pub class_path: String,
    pub role: EntityRole,
    pub capabilities: Capabilities,
    pub fields: FieldBag,
    pub components: Vec<ComponentTemplate>,
    pub tags: BTreeSet<String>,
}

impl EntityTemplate {
    pub fn new(class_path: impl Into<String>) -> Self {
        Self {
            class_path: class_path.into(),
            role: EntityRole::Generic,
            capabilities: Capabilities::SUPPORTS_PERSISTENCE | Capabilities::MOVABLE,
            fields: FieldBag::new(),
            components: Vec::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_component(mut self, component: ComponentTemplate) -> Self {
        self.components.push(component);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Errors from [`WorldHost::spawn`].
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("an entity named {0} already exists")]
    DuplicateName(String),
    #[error("spawn requires a non-empty name")]
    EmptyName,
    #[error("entity class {0} cannot be instantiated")]
    NotInstantiable(String),
}

/// Everything the save engine needs from the live entity runtime.
///
/// All methods are called on the context that owns the entity graph. Entity
/// ids are relations, not ownership: any of them may have gone stale, and the
/// host answers `None`/`false` for stale ids.
pub trait WorldHost {
    /// Name of the persistent region the session is running in.
    fn level_name(&self) -> &str;
    fn is_paused(&self) -> bool;
    /// True when this process is authoritative over simulation.
    fn has_authority(&self) -> bool;
    fn viewer_location(&self) -> Option<Vec3>;
    /// Monotonic world time in seconds.
    fn time_seconds(&self) -> f64;
    /// Streaming sub-regions currently loaded.
    fn loaded_regions(&self) -> Vec<String>;

    fn entity_ids(&self) -> Vec<EntityId>;
    fn entity(&self, id: EntityId) -> Option<EntityView>;
    fn is_alive(&self, id: EntityId) -> bool {
        self.entity(id).is_some()
    }
    /// Scene-graph lookup by exact entity name.
    fn find_by_name(&self, name: &str) -> Option<EntityId>;

    fn fields(&self, id: EntityId) -> Option<FieldBag>;
    /// Merge `fields` into the entity's field bag.
    fn apply_fields(&mut self, id: EntityId, fields: FieldBag) -> bool;
    fn components(&self, id: EntityId) -> Vec<ComponentView>;
    fn component_fields(&self, id: EntityId, component: &str) -> Option<FieldBag>;
    fn apply_component(
        &mut self,
        id: EntityId,
        component: &str,
        relative: Option<Transform>,
        fields: FieldBag,
    ) -> bool;

    fn set_transform(&mut self, id: EntityId, transform: Transform) -> bool;
    fn add_tag(&mut self, id: EntityId, tag: &str) -> bool;
    fn remove_tag(&mut self, id: EntityId, tag: &str) -> bool;

    /// Create an entity named `name`. Fails if the name is taken.
    fn spawn(
        &mut self,
        template: EntityTemplate,
        name: &str,
        transform: Transform,
    ) -> Result<EntityId, SpawnError>;
    fn destroy(&mut self, id: EntityId) -> bool;

    fn player_controller(&self) -> Option<EntityId>;
    fn player_pawn(&self) -> Option<EntityId>;
    fn player_state(&self) -> Option<EntityId>;
    fn mode_controller(&self) -> Option<EntityId>;
    fn state_controller(&self) -> Option<EntityId>;
    fn control_rotation(&self) -> Option<Quat>;
    fn set_control_rotation(&mut self, rotation: Quat) -> bool;
    /// Display names of everyone taking part in the session.
    fn participant_names(&self) -> Vec<String>;

    /// Drain mutation events recorded since the last call.
    fn drain_events(&mut self) -> Vec<WorldEvent>;
}
