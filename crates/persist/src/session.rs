//! Session-scoped state.
//!
//! One [`Session`] exists per running world. It is created on first use and
//! holds everything that must survive between save/load calls but is never
//! written to storage directly: the region memory used by multi-region
//! composition, the slot and custom-object caches, and the versions detected
//! by the last load.
//!
//! # Lifecycle
//! - Switching user clears every cache, since the storage namespace changes.
//! - Switching slot clears region memory; cached slot info and custom objects
//!   are keyed by slot and stay valid.
//! - [`Session::clear_region_memory`] is the explicit reset.

use std::collections::{BTreeMap, HashMap};
use keepsake_common::EntityId;

use crate::archive::{
    ComponentRecord, EntityPayload, PlayerArchive, PlayerStack, RegionArchive, SavedEntityRecord,
    SlotInfoRecord, StreamingAggregate,
};
use crate::custom::ErasedCustom;
use crate::directory::{KeyLayout, sanitize_name};
use crate::envelope::LoadedVersions;
use crate::ledger::VersionLedger;
use crate::settings::Settings;

/// Identity of the virtual region that holds persistent entities in a stack.
pub const PERSISTENT_REGION: &str = "PersistentRegion";

/// In-memory copies of region data seen this session.
#[derive(Debug, Clone, Default)]
pub struct RegionMemory {
    /// Archives of visited regions, without the persistent region.
    pub stack: Vec<RegionArchive>,
    pub aggregate: StreamingAggregate,
    pub player: PlayerStack,
}

impl RegionMemory {
    pub fn clear(&mut self) {
        self.stack.clear();
        self.aggregate = StreamingAggregate::default();
        self.player = PlayerStack::default();
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty() && self.aggregate.is_empty() && self.player.is_empty()
    }
}

/// Decoded payloads from the most recent loads, kept so raw objects can be
/// recovered after the fact.
#[derive(Debug, Clone, Default)]
pub struct LoadedPayloads {
    pub player: PlayerArchive,
    pub mode: EntityPayload,
    pub state: EntityPayload,
}

pub struct Session {
    slot: String,
    user: Option<String>,
    layout: KeyLayout,
    pub(crate) loaded: LoadedVersions,
    pub(crate) ledger: VersionLedger,
    pub(crate) memory: RegionMemory,
    pub(crate) payloads: LoadedPayloads,
    pub(crate) slots: HashMap<String, SlotInfoRecord>,
    pub(crate) custom: BTreeMap<String, Box<dyn ErasedCustom>>,
    /// Placed entities destroyed since the last level save.
    pub(crate) destroyed: Vec<SavedEntityRecord>,
    /// Placed entities captured as their region streamed out.
    pub(crate) partition_records: Vec<SavedEntityRecord>,
    /// Raw objects to append to an entity's component list on save.
    pub(crate) raw_objects: HashMap<EntityId, Vec<ComponentRecord>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.slot)
            .field("user", &self.user)
            .field("cached_slots", &self.slots.len())
            .field("cached_custom", &self.custom.keys().collect::<Vec<_>>())
            .field("stacked_regions", &self.memory.stack.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(settings: &Settings) -> Self {
        Self {
            slot: settings.default_slot_name.clone(),
            user: None,
            layout: KeyLayout::new(settings, None),
            loaded: LoadedVersions::default(),
            ledger: VersionLedger::new(),
            memory: RegionMemory::default(),
            payloads: LoadedPayloads::default(),
            slots: HashMap::new(),
            custom: BTreeMap::new(),
            destroyed: Vec::new(),
            partition_records: Vec::new(),
            raw_objects: HashMap::new(),
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn memory(&self) -> &RegionMemory {
        &self.memory
    }

    /// Make `name` the current slot. An empty name selects the configured
    /// default. Returns the sanitized name.
    pub fn set_slot(&mut self, settings: &Settings, name: &str) -> &str {
        let sanitized = if name.is_empty() {
            settings.default_slot_name.clone()
        } else {
            sanitize_name(name)
        };
        if sanitized != self.slot {
            tracing::info!(from = %self.slot, to = %sanitized, "current slot changed");
            self.slot = sanitized;
            self.clear_region_memory();
        }
        &self.slot
    }

    /// Switch the save user. `None` or an empty name selects the shared
    /// namespace. Returns whether anything changed.
    pub fn set_user(&mut self, settings: &Settings, user: Option<&str>) -> bool {
        let user = user.filter(|u| !u.is_empty()).map(sanitize_name);
        if user == self.user {
            return false;
        }
        self.user = user;
        self.layout = KeyLayout::new(settings, self.user.as_deref());
        self.clear_caches();
        tracing::info!(user = ?self.user, "current save user changed");
        true
    }

    pub fn clear_region_memory(&mut self) {
        self.memory.clear();
        self.payloads = LoadedPayloads::default();
        self.partition_records.clear();
    }

    pub fn clear_caches(&mut self) {
        self.slots.clear();
        self.custom.clear();
        self.clear_region_memory();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::FileSaveMethod;

    #[test]
    fn starts_on_the_default_slot() {
        let s = Session::new(&Settings::default());
        assert_eq!(s.slot(), "SaveGame1");
        assert!(s.user().is_none());
        assert!(s.memory().is_empty());
    }

    #[test]
    fn slot_names_are_sanitized_and_reset_memory() {
        let settings = Settings::default();
        let mut s = Session::new(&settings);
        s.memory.stack.push(RegionArchive::new("Level1"));
        assert_eq!(s.set_slot(&settings, "My Save.2"), "My_Save_2");
        assert!(s.memory().is_empty());
        assert_eq!(s.set_slot(&settings, ""), "SaveGame1");
    }

    #[test]
    fn same_slot_keeps_memory() {
        let settings = Settings::default();
        let mut s = Session::new(&settings);
        s.memory.stack.push(RegionArchive::new("Level1"));
        s.set_slot(&settings, "SaveGame1");
        assert_eq!(s.memory().stack.len(), 1);
    }

    #[test]
    fn user_switch_clears_caches_and_moves_namespace() {
        let settings = Settings::default();
        let mut s = Session::new(&settings);
        s.slots.insert(
            "SaveGame1".into(),
            SlotInfoRecord {
                name: "SaveGame1".into(),
                timestamp: chrono::Utc::now(),
                region: "Level1".into(),
                players: vec![],
            },
        );
        assert!(s.set_user(&settings, Some("ada")));
        assert!(s.slots.is_empty());
        assert_eq!(s.layout().user(), Some("ada"));
        assert!(!s.set_user(&settings, Some("ada")));
        assert!(s.set_user(&settings, None));
        assert_eq!(s.layout().user(), None);
    }

    #[test]
    fn flat_layout_ignores_users() {
        let settings = Settings {
            file_save_method: FileSaveMethod::Console,
            ..Settings::default()
        };
        let mut s = Session::new(&settings);
        s.set_user(&settings, Some("ada"));
        assert_eq!(s.layout().user(), None);
    }
}
