use bitflags::bitflags;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Tolerance used by the "nearly zero" checks on positions and rotations.
pub const NEARLY_ZERO: f32 = 1.0e-4;

/// Handle to a live entity. Only meaningful while the entity is alive; every
/// dereference goes through the owning world, which reports stale handles as
/// missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Spatial transform: position, rotation, scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    /// A transform is usable for restore when every component is finite and
    /// the scale is not collapsed.
    pub fn is_valid(&self) -> bool {
        self.position.is_finite()
            && self.rotation.is_finite()
            && self.scale.is_finite()
            && self.scale.abs().min_element() > NEARLY_ZERO
    }

    /// True when position sits at the origin and rotation is identity.
    pub fn is_nearly_zero(&self) -> bool {
        position_nearly_zero(self.position) && rotation_nearly_zero(self.rotation)
    }
}

pub fn position_nearly_zero(v: Vec3) -> bool {
    v.length() < NEARLY_ZERO
}

pub fn rotation_nearly_zero(q: Quat) -> bool {
    q.abs_diff_eq(Quat::IDENTITY, NEARLY_ZERO) || q.abs_diff_eq(-Quat::IDENTITY, NEARLY_ZERO)
}

/// A dynamically typed field value held in an entity's field bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Vec3([f32; 3]),
    Struct(FieldBag),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&FieldBag> {
        match self {
            Value::Struct(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec3> for Value {
    fn from(v: Vec3) -> Self {
        Value::Vec3(v.to_array())
    }
}

/// Named fields of an entity, component, or nested structure.
///
/// BTreeMap keeps encoding order stable across runs.
pub type FieldBag = BTreeMap<String, Value>;

bitflags! {
    /// Protocols a type or live entity declares support for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        /// Participates in save/load.
        const SUPPORTS_PERSISTENCE = 1 << 0;
        /// Can be moved at runtime; transforms are only restored on movable things.
        const MOVABLE              = 1 << 1;
    }
}

/// Reserved tag names understood by the save engine.
pub mod tags {
    /// Set once an entity has been through a load pass this session.
    pub const HAS_LOADED: &str = "HasLoaded";
    /// Excludes the entity from capture entirely.
    pub const SKIP_SAVE: &str = "SkipSave";
    /// Entity survives across regions.
    pub const PERSISTENT: &str = "Persistent";
    /// Transform is neither captured nor restored.
    pub const SKIP_TRANSFORM: &str = "SkipTransform";
    /// A player-controlled pawn that should be saved with the level instead of the player.
    pub const PAWN_AS_LEVEL_ENTITY: &str = "PawnAsLevelEntity";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_uniqueness() {
        let a = EntityId::new();
        let b = EntityId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn transform_default_is_identity() {
        let t = Transform::default();
        assert_eq!(t.position, Vec3::ZERO);
        assert_eq!(t.rotation, Quat::IDENTITY);
        assert_eq!(t.scale, Vec3::ONE);
        assert!(t.is_valid());
        assert!(t.is_nearly_zero());
    }

    #[test]
    fn collapsed_scale_is_invalid() {
        let t = Transform {
            scale: Vec3::ZERO,
            ..Transform::default()
        };
        assert!(!t.is_valid());
        let nan = Transform::from_position(Vec3::new(f32::NAN, 0.0, 0.0));
        assert!(!nan.is_valid());
    }

    #[test]
    fn rotation_near_identity() {
        assert!(rotation_nearly_zero(Quat::IDENTITY));
        assert!(!rotation_nearly_zero(Quat::from_rotation_y(0.5)));
        assert!(!position_nearly_zero(Vec3::X));
    }

    #[test]
    fn capabilities_combine() {
        let caps = Capabilities::SUPPORTS_PERSISTENCE | Capabilities::MOVABLE;
        assert!(caps.contains(Capabilities::MOVABLE));
        assert!(!Capabilities::default().contains(Capabilities::SUPPORTS_PERSISTENCE));
    }
}
