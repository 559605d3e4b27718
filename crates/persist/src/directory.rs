//! Slot and user namespaces over a [`StorageBackend`].
//!
//! Key layout: `{prefix}{user segment}{slot or file name}{separator}{artifact}`
//! where the separator is `/` for folder-style backends and `_` for flat ones,
//! and the user segment is `Users/{name}/` (folder-style only).

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use crate::error::Result;
use crate::settings::Settings;
use crate::storage::StorageBackend;

const USERS_SEGMENT: &str = "Users";

/// The default files written for every slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Player,
    Level,
    Slot,
    Thumb,
}

impl Artifact {
    pub const ALL: [Artifact; 4] = [
        Artifact::Player,
        Artifact::Level,
        Artifact::Slot,
        Artifact::Thumb,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            Artifact::Player => "Player",
            Artifact::Level => "Level",
            Artifact::Slot => "Slot",
            Artifact::Thumb => "Thumb",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Make a user-supplied name safe for use as a key segment.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .map(|c| if c == ' ' || c == '.' { '_' } else { c })
        .collect()
}

/// How keys are composed for the current user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
    user: Option<String>,
    flat: bool,
}

impl KeyLayout {
    pub fn new(settings: &Settings, user: Option<&str>) -> Self {
        let flat = settings.is_flat_namespace();
        Self {
            prefix: settings.key_prefix.clone(),
            user: if flat {
                None
            } else {
                user.filter(|u| !u.is_empty()).map(str::to_owned)
            },
            flat,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.flat
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn separator(&self) -> char {
        if self.flat { '_' } else { '/' }
    }

    /// Everything belonging to the current user lives under this.
    pub fn user_root(&self) -> String {
        match &self.user {
            Some(user) => format!("{}{USERS_SEGMENT}/{user}/", self.prefix),
            None => self.prefix.clone(),
        }
    }

    pub fn slot_key(&self, slot: &str, artifact: Artifact) -> String {
        self.file_key(slot, artifact.suffix())
    }

    /// Key of a file scoped to `slot`.
    pub fn file_key(&self, slot: &str, file: &str) -> String {
        format!("{}{slot}{}{file}", self.user_root(), self.separator())
    }

    /// Key of a custom object, optionally scoped to a slot.
    pub fn custom_key(&self, name: &str, slot: Option<&str>) -> String {
        match slot {
            Some(slot) => self.file_key(slot, name),
            None => format!("{}{name}", self.user_root()),
        }
    }

    fn users_root(&self) -> String {
        format!("{}{USERS_SEGMENT}/", self.prefix)
    }
}

/// Enumeration and deletion of slots and users.
pub struct SlotDirectory<'a> {
    backend: &'a dyn StorageBackend,
    layout: &'a KeyLayout,
}

impl<'a> SlotDirectory<'a> {
    pub fn new(backend: &'a dyn StorageBackend, layout: &'a KeyLayout) -> Self {
        Self { backend, layout }
    }

    /// Slot names, most recently written first.
    pub fn list_slots(&self) -> Result<Vec<String>> {
        let root = self.layout.user_root();
        let mut stamps: BTreeMap<String, Option<SystemTime>> = BTreeMap::new();
        for key in self.backend.list_keys()? {
            let Some(rest) = key.strip_prefix(&root) else {
                continue;
            };
            let slot = if self.layout.is_flat() {
                // Flat backends have no folders; a slot exists where its
                // reserved slot-info file does.
                let suffix = format!("_{}", Artifact::Slot.suffix());
                match rest.strip_suffix(&suffix) {
                    Some(slot) if !slot.is_empty() => slot,
                    _ => continue,
                }
            } else {
                if self.layout.user().is_none() && rest.starts_with(&format!("{USERS_SEGMENT}/")) {
                    continue;
                }
                match rest.split_once('/') {
                    Some((slot, _)) if !slot.is_empty() => slot,
                    _ => continue,
                }
            };
            let stamp = self.backend.modified(&key);
            let entry = stamps.entry(slot.to_owned()).or_insert(None);
            *entry = (*entry).max(stamp);
        }
        // Prefer the slot-info file's own stamp where it exists.
        let mut slots: Vec<(String, Option<SystemTime>)> = stamps
            .into_iter()
            .map(|(slot, fallback)| {
                let info = self
                    .backend
                    .modified(&self.layout.slot_key(&slot, Artifact::Slot));
                (slot, info.or(fallback))
            })
            .collect();
        slots.sort_by(|a, b| Reverse(a.1).cmp(&Reverse(b.1)).then_with(|| a.0.cmp(&b.0)));
        Ok(slots.into_iter().map(|(slot, _)| slot).collect())
    }

    /// Remove every default artifact of `slot`, the `extra_keys` supplied by
    /// the caller, and in folder mode anything else in the slot's folder.
    /// Returns the number of blobs removed.
    pub fn delete_slot(&self, slot: &str, extra_keys: &[String]) -> Result<usize> {
        let mut doomed: Vec<String> = Artifact::ALL
            .iter()
            .map(|a| self.layout.slot_key(slot, *a))
            .collect();
        doomed.extend(extra_keys.iter().cloned());
        if !self.layout.is_flat() {
            let folder = format!("{}{slot}/", self.layout.user_root());
            doomed.extend(
                self.backend
                    .list_keys()?
                    .into_iter()
                    .filter(|k| k.starts_with(&folder)),
            );
        }
        doomed.sort();
        doomed.dedup();
        let mut removed = 0;
        for key in &doomed {
            if self.backend.delete(key)? {
                removed += 1;
            }
        }
        tracing::info!(slot, removed, "deleted slot");
        Ok(removed)
    }

    /// Names of users with at least one stored blob.
    pub fn list_users(&self) -> Result<Vec<String>> {
        if self.layout.is_flat() {
            return Ok(Vec::new());
        }
        let root = self.layout.users_root();
        let mut users: Vec<String> = self
            .backend
            .list_keys()?
            .iter()
            .filter_map(|k| k.strip_prefix(&root))
            .filter_map(|rest| rest.split_once('/').map(|(user, _)| user.to_owned()))
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    /// Remove everything stored for `user`. Returns the number of blobs removed.
    pub fn delete_user(&self, user: &str) -> Result<usize> {
        if self.layout.is_flat() || user.is_empty() {
            return Ok(0);
        }
        let root = format!("{}{user}/", self.layout.users_root());
        let mut removed = 0;
        for key in self.backend.list_keys()? {
            if key.starts_with(&root) && self.backend.delete(&key)? {
                removed += 1;
            }
        }
        tracing::info!(user, removed, "deleted user");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::FileSaveMethod;
    use crate::storage::MemoryBackend;

    fn layout(flat: bool, user: Option<&str>) -> KeyLayout {
        let settings = Settings {
            file_save_method: if flat {
                FileSaveMethod::Console
            } else {
                FileSaveMethod::Desktop
            },
            ..Settings::default()
        };
        KeyLayout::new(&settings, user)
    }

    #[test]
    fn key_naming() {
        let desk = layout(false, None);
        assert_eq!(desk.slot_key("Slot1", Artifact::Level), "Slot1/Level");
        assert_eq!(desk.custom_key("Options", None), "Options");
        assert_eq!(desk.custom_key("Quest", Some("Slot1")), "Slot1/Quest");

        let user = layout(false, Some("ada"));
        assert_eq!(user.slot_key("Slot1", Artifact::Thumb), "Users/ada/Slot1/Thumb");

        let flat = layout(true, Some("ada"));
        assert_eq!(flat.user(), None);
        assert_eq!(flat.slot_key("Slot1", Artifact::Player), "Slot1_Player");
    }

    #[test]
    fn sanitize_replaces_and_drops() {
        assert_eq!(sanitize_name("My Save.v2"), "My_Save_v2");
        assert_eq!(sanitize_name("a/b:c*?"), "abc");
    }

    #[test]
    fn slots_sort_newest_first() {
        for flat in [false, true] {
            let backend = MemoryBackend::new();
            let l = layout(flat, None);
            backend.put(&l.slot_key("Old", Artifact::Slot), b"").unwrap();
            backend.put(&l.slot_key("Old", Artifact::Level), b"").unwrap();
            backend.put(&l.slot_key("New", Artifact::Slot), b"").unwrap();
            backend.put(&l.custom_key("Options", None), b"").unwrap();
            let dir = SlotDirectory::new(&backend, &l);
            assert_eq!(dir.list_slots().unwrap(), vec!["New", "Old"], "flat={flat}");

            // Rewriting the old slot's info makes it the newest.
            backend.put(&l.slot_key("Old", Artifact::Slot), b"").unwrap();
            assert_eq!(dir.list_slots().unwrap(), vec!["Old", "New"], "flat={flat}");
        }
    }

    #[test]
    fn users_are_isolated() {
        let backend = MemoryBackend::new();
        let global = layout(false, None);
        let ada = layout(false, Some("ada"));
        backend.put(&global.slot_key("Shared", Artifact::Slot), b"").unwrap();
        backend.put(&ada.slot_key("Mine", Artifact::Slot), b"").unwrap();

        assert_eq!(SlotDirectory::new(&backend, &global).list_slots().unwrap(), vec!["Shared"]);
        let dir = SlotDirectory::new(&backend, &ada);
        assert_eq!(dir.list_slots().unwrap(), vec!["Mine"]);
        assert_eq!(dir.list_users().unwrap(), vec!["ada"]);

        assert_eq!(dir.delete_user("ada").unwrap(), 1);
        assert!(dir.list_users().unwrap().is_empty());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn delete_slot_removes_artifacts_and_extras() {
        let backend = MemoryBackend::new();
        let l = layout(true, None);
        for a in Artifact::ALL {
            backend.put(&l.slot_key("A", a), b"").unwrap();
        }
        backend.put(&l.custom_key("Quest", Some("A")), b"").unwrap();
        backend.put(&l.slot_key("A_B", Artifact::Slot), b"").unwrap();

        let dir = SlotDirectory::new(&backend, &l);
        let extra = vec![l.custom_key("Quest", Some("A"))];
        assert_eq!(dir.delete_slot("A", &extra).unwrap(), 5);
        assert_eq!(dir.list_slots().unwrap(), vec!["A_B"]);
    }

    #[test]
    fn delete_slot_sweeps_the_folder() {
        let backend = MemoryBackend::new();
        let l = layout(false, None);
        backend.put(&l.slot_key("A", Artifact::Level), b"").unwrap();
        backend.put(&l.custom_key("Quest", Some("A")), b"").unwrap();
        backend.put(&l.slot_key("AB", Artifact::Level), b"").unwrap();
        let dir = SlotDirectory::new(&backend, &l);
        assert_eq!(dir.delete_slot("A", &[]).unwrap(), 2);
        assert_eq!(backend.len(), 1);
    }
}
