//! Shared value types used by every keepsake crate.

mod types;

pub use types::{
    Capabilities, EntityId, FieldBag, NEARLY_ZERO, Transform, Value, position_nearly_zero,
    rotation_nearly_zero, tags,
};
