//! Version identification written after all structural content of a unit.

use serde::{Deserialize, Serialize};

use crate::error::ArchiveKind;
use crate::wire::{ByteReader, ByteWriter, WireError};

/// Plugin and game version strings. Compared by case-insensitive equality,
/// never ordered.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct VersionTag {
    pub plugin: String,
    pub game: String,
}

impl VersionTag {
    pub fn new(plugin: impl Into<String>, game: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            game: game.into(),
        }
    }
}

impl PartialEq for VersionTag {
    fn eq(&self, other: &Self) -> bool {
        self.plugin.eq_ignore_ascii_case(&other.plugin) && self.game.eq_ignore_ascii_case(&other.game)
    }
}

/// Append `tag` to a unit that already holds all of its structural content.
pub fn stamp(unit: &mut Vec<u8>, tag: &VersionTag) -> Result<(), WireError> {
    let mut w = ByteWriter::with_capacity(tag.plugin.len() + tag.game.len() + 4);
    w.put_str(&tag.plugin)?;
    w.put_str(&tag.game)?;
    unit.extend_from_slice(&w.into_inner());
    Ok(())
}

/// Read the tail that follows the body. Units written without one yield `None`.
pub fn read_tail(r: &mut ByteReader<'_>) -> Result<Option<VersionTag>, WireError> {
    if r.is_empty() {
        return Ok(None);
    }
    let plugin = r.string()?;
    let game = r.string()?;
    Ok(Some(VersionTag { plugin, game }))
}

/// Tags collected from every unit loaded during one version check.
#[derive(Debug, Clone, Default)]
pub struct VersionLedger {
    entries: Vec<(ArchiveKind, VersionTag)>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ArchiveKind, tag: VersionTag) {
        tracing::debug!(%kind, plugin = %tag.plugin, game = %tag.game, "recorded version tag");
        self.entries.push((kind, tag));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// True only if at least one tag was recorded, all tags agree, and their
    /// game version is `expected_game`.
    pub fn verify(&self, expected_game: &str) -> bool {
        let Some((first_kind, first)) = self.entries.first() else {
            tracing::warn!("version check failed: no versioned units were loaded");
            return false;
        };
        for (kind, tag) in &self.entries[1..] {
            if tag != first {
                tracing::warn!(
                    %first_kind,
                    %kind,
                    first_game = %first.game,
                    game = %tag.game,
                    first_plugin = %first.plugin,
                    plugin = %tag.plugin,
                    "version mismatch between loaded units"
                );
                return false;
            }
        }
        if !first.game.eq_ignore_ascii_case(expected_game) {
            tracing::warn!(
                found = %first.game,
                expected = %expected_game,
                "saved game version differs from the configured one"
            );
            return false;
        }
        true
    }
}
