//! Keepsake: save-game persistence for a live entity world.
//!
//! A save captures the player side, the level side, or both, into the current
//! slot. Each stored unit is a versioned envelope around a CBOR body, stamped
//! with a version tail and zstd-compressed on folder-style backends. Loads
//! reconcile saved records against live entities by identity name, spawning
//! runtime entities that no longer exist and destroying placed ones that were
//! destroyed before the save.
//!
//! # Invariants
//! - An entity is loaded at most once per session unless a full reload resets
//!   its side.
//! - Immediate, deferred and threaded loads reach the same world state; only
//!   the completion signal's timing differs.
//! - Overlapping operations of the same kind are rejected, never queued.
//! - Encoding is deterministic: identical worlds produce identical bodies.
//! - Malformed or truncated input is an error, never a panic.

pub mod admission;
pub mod archive;
pub mod capture;
pub mod codec;
pub mod compose;
pub mod compress;
pub mod custom;
pub mod directory;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod reconcile;
pub mod registry;
pub mod schema;
pub mod session;
pub mod settings;
pub mod storage;
pub mod unit;
pub mod wire;

pub use admission::{Direction, OperationMode};
pub use archive::{EntityKind, SavedEntityRecord, SlotInfoRecord};
pub use custom::CustomSave;
pub use directory::{Artifact, KeyLayout, sanitize_name};
pub use engine::SaveEngine;
pub use envelope::{EnvelopeHeader, FormatVersion};
pub use error::{ArchiveKind, PersistError, Result};
pub use ledger::VersionTag;
pub use reconcile::{LoadReport, LoadTask, Outcome};
pub use registry::TypeRegistry;
pub use schema::{FieldType, SchemaRegistry, TypeSchema};
pub use settings::{
    FileSaveMethod, LegacyFormat, LoadMethod, MultiRegionMethod, Settings, WorldPartitionMethod,
};
pub use storage::{FileBackend, MemoryBackend, StorageBackend};
pub use unit::{DecodedUnit, decode_unit, encode_unit};
