//! World kernel: the live entity graph the save engine reads from and writes to.
//!
//! # Invariants
//! - All state mutations flow through explicit operations and are logged.
//! - Entity names are unique within a world; spawning a taken name fails.
//! - Entity ids are relations, never ownership. Stale ids resolve to nothing.

pub mod host;
pub mod world;

pub use host::{
    ComponentTemplate, ComponentView, EntityRole, EntityTemplate, EntityView, SpawnError,
    WorldHost,
};
pub use world::{ComponentData, EntityData, World, WorldEvent};
