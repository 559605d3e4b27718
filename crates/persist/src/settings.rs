//! Engine configuration.
//!
//! Every policy switch the engine consults lives here. Files are YAML or JSON,
//! chosen by extension; missing keys take their defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{PersistError, Result};

/// How saved data from several regions is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MultiRegionMethod {
    /// One archive for the current region only.
    #[default]
    Disabled,
    /// Keep one archive per visited region in a stack.
    Basic,
    /// Fold all regions into a single streaming aggregate.
    Streaming,
    /// Streaming aggregate, folded into the stack.
    Full,
}

/// How reconciliation is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadMethod {
    #[default]
    Immediate,
    Deferred,
    Threaded,
}

/// Backend style. Console backends expose a flat namespace and forbid
/// compressed blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileSaveMethod {
    #[default]
    Desktop,
    Console,
}

/// Which historical structural format untagged archives are read as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LegacyFormat {
    Gen1,
    #[default]
    Gen2,
    Gen3,
}

/// Automatic save/load when streaming sub-regions come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorldPartitionMethod {
    Enabled,
    /// Only restore when regions appear; never save on hide.
    LoadOnly,
    /// Ignore region changes during the settling window after session start.
    SkipInitial,
    #[default]
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_slot_name: String,
    /// Expected game version; stamped as `SAVEGAME_{game_version}`.
    pub game_version: String,
    /// Engine build number; stamped as `KSV_{build_number}`.
    pub build_number: u32,
    pub multi_region: MultiRegionMethod,
    pub load_method: LoadMethod,
    /// Records reconciled per tick under [`LoadMethod::Deferred`].
    pub deferred_batch_size: usize,
    pub file_save_method: FileSaveMethod,
    pub legacy_format: LegacyFormat,
    /// Tag per-object payloads with the structural marker in multi-region modes.
    pub object_version_tag: bool,
    pub simple_entity_names: bool,
    /// Fall back to a scene-graph name lookup before spawning.
    pub advanced_spawn_check: bool,
    /// Remember destroyed placed entities and destroy them again on load.
    pub auto_destroy: bool,
    /// Propagate the persistence flag into nested structures before saving.
    pub auto_save_structs: bool,
    /// Restore mode/state controllers regardless of region.
    pub persistent_game_mode: bool,
    /// Keep player transforms across regions instead of restoring them.
    pub persistent_player: bool,
    pub world_partition: WorldPartitionMethod,
    /// Old class path to new class path.
    pub class_redirects: BTreeMap<String, String>,
    pub compression_level: i32,
    /// Namespace root prepended to every storage key.
    pub key_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_slot_name: "SaveGame1".to_owned(),
            game_version: "1".to_owned(),
            build_number: 158,
            multi_region: MultiRegionMethod::default(),
            load_method: LoadMethod::default(),
            deferred_batch_size: 8,
            file_save_method: FileSaveMethod::default(),
            legacy_format: LegacyFormat::default(),
            object_version_tag: true,
            simple_entity_names: false,
            advanced_spawn_check: false,
            auto_destroy: true,
            auto_save_structs: true,
            persistent_game_mode: false,
            persistent_player: false,
            world_partition: WorldPartitionMethod::default(),
            class_redirects: BTreeMap::new(),
            compression_level: 3,
            key_prefix: String::new(),
        }
    }
}

impl Settings {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PersistError::StorageIo {
            key: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            other => Err(PersistError::Settings(format!(
                "unsupported settings extension {other:?}"
            ))),
        }
    }

    /// Multi-region methods that keep a per-region stack.
    pub fn is_stack_based(&self) -> bool {
        matches!(
            self.multi_region,
            MultiRegionMethod::Basic | MultiRegionMethod::Full
        )
    }

    pub fn contains_streaming(&self) -> bool {
        matches!(
            self.multi_region,
            MultiRegionMethod::Streaming | MultiRegionMethod::Full
        )
    }

    pub fn multi_region_active(&self) -> bool {
        self.multi_region != MultiRegionMethod::Disabled
    }

    pub fn is_flat_namespace(&self) -> bool {
        self.file_save_method == FileSaveMethod::Console
    }

    /// World-partition handling is on in any form.
    pub fn partition_active(&self) -> bool {
        self.world_partition != WorldPartitionMethod::Disabled
    }

    /// Persistent player only applies when regions are not stacked.
    pub fn persistent_player_applies(&self) -> bool {
        self.persistent_player && !self.is_stack_based()
    }

    /// Region hides trigger a level save.
    pub fn partition_saves_on_hide(&self) -> bool {
        matches!(
            self.world_partition,
            WorldPartitionMethod::Enabled | WorldPartitionMethod::SkipInitial
        )
    }

    pub fn plugin_version(&self) -> String {
        format!("KSV_{}", self.build_number)
    }

    pub fn expected_game_version(&self) -> String {
        format!("SAVEGAME_{}", self.game_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        assert_eq!(s.default_slot_name, "SaveGame1");
        assert!(!s.is_stack_based());
        assert!(!s.multi_region_active());
        assert_eq!(s.expected_game_version(), "SAVEGAME_1");
        assert_eq!(s.plugin_version(), "KSV_158");
    }

    #[test]
    fn yaml_overrides_and_defaults() {
        let s = Settings::from_yaml_str(
            "game_version: \"3\"\nmulti_region: Full\nload_method: Threaded\n",
        )
        .unwrap();
        assert_eq!(s.game_version, "3");
        assert!(s.is_stack_based());
        assert!(s.contains_streaming());
        assert_eq!(s.load_method, LoadMethod::Threaded);
        assert_eq!(s.deferred_batch_size, 8);
    }

    #[test]
    fn json_file_loads_by_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keepsake.json");
        std::fs::write(
            &path,
            r#"{"file_save_method":"Console","class_redirects":{"/Old":"/New"}}"#,
        )
        .unwrap();
        let s = Settings::load(&path).unwrap();
        assert!(s.is_flat_namespace());
        assert_eq!(s.class_redirects.get("/Old").map(String::as_str), Some("/New"));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keepsake.toml");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(Settings::load(&path), Err(PersistError::Settings(_))));
    }

    #[test]
    fn persistent_player_ignored_when_stacked() {
        let s = Settings {
            persistent_player: true,
            multi_region: MultiRegionMethod::Basic,
            ..Settings::default()
        };
        assert!(!s.persistent_player_applies());
    }
}
