//! The save engine: the one entry point hosts talk to.
//!
//! [`SaveEngine`] owns the storage backend, the type and schema registries,
//! admission control and the session. Every world-touching call takes the
//! world explicitly and runs on the caller's context; a threaded load only
//! moves decoding off it.
//!
//! Benign failures (nothing stored, operation rejected) come back as
//! `Ok(false)`. Everything else is logged with the slot and archive kind and
//! returned.

use std::collections::HashMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use chrono::Utc;
use keepsake_common::{
    EntityId, FieldBag, Transform, position_nearly_zero, rotation_nearly_zero, tags,
};
use keepsake_kernel::{WorldEvent, WorldHost};
use keepsake_stream::{Debounce, LONG_DELAY, RegionTracker, SHORT_DELAY};

use crate::admission::{Direction, OperationMode, OperationRegistry, OperationTicket, Rejection};
use crate::archive::{
    ComponentRecord, EntityKind, PlayerArchive, SavedEntityRecord, SlotInfoRecord,
    raw_object_key, replace_or_push_entity,
};
use crate::capture::{Capturer, NamePolicy, ReloadFlags, Selection, classify, destroyed_record, prepare_entities};
use crate::codec::{ObjectCodec, TagSubject};
use crate::compose::{compose_level, compose_player, decompose_level, decompose_player, from_body, to_body};
use crate::custom::{CustomEntry, CustomSave, cache_key, decode_body, downcast};
use crate::directory::{Artifact, SlotDirectory, sanitize_name};
use crate::envelope::FormatVersion;
use crate::error::{ArchiveKind, PersistError, Result};
use crate::reconcile::{LoadReport, LoadTask, PendingLoad, Reconciler, sort_by_distance};
use crate::registry::TypeRegistry;
use crate::schema::SchemaRegistry;
use crate::session::Session;
use crate::settings::{LoadMethod, Settings, WorldPartitionMethod};
use crate::storage::StorageBackend;
use crate::unit::{decode_unit, encode_unit, version_tag};

pub struct SaveEngine {
    settings: Settings,
    backend: Arc<dyn StorageBackend>,
    types: Arc<TypeRegistry>,
    schemas: SchemaRegistry,
    selection: Selection,
    operations: OperationRegistry,
    session: Option<Session>,
    regions: RegionTracker,
    partition_save: Debounce,
    partition_load: Debounce,
    pending: Option<PendingLoad>,
    last_report: Option<LoadReport>,
}

impl std::fmt::Debug for SaveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveEngine")
            .field("backend", &self.backend)
            .field("session", &self.session)
            .field("loading", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

/// The session, created on first use.
fn session_of<'a>(session: &'a mut Option<Session>, settings: &Settings) -> &'a mut Session {
    session.get_or_insert_with(|| Session::new(settings))
}

fn store_unit(
    backend: &dyn StorageBackend,
    settings: &Settings,
    key: &str,
    body: &[u8],
    kind: ArchiveKind,
) -> Result<()> {
    let unit = encode_unit(settings, body)?;
    backend.put(key, &unit)?;
    tracing::debug!(key, %kind, bytes = unit.len(), "stored unit");
    Ok(())
}

/// Read and unwrap a unit, remembering its versions for nested decoding.
fn load_unit(
    backend: &dyn StorageBackend,
    settings: &Settings,
    session: &mut Session,
    key: &str,
    kind: ArchiveKind,
) -> Result<Vec<u8>> {
    let bytes = backend.get(key)?;
    let unit = decode_unit(settings, &bytes, kind)?;
    session.loaded.record(&unit.header);
    match &unit.tag {
        Some(tag) if !tag.game.eq_ignore_ascii_case(&settings.expected_game_version()) => {
            tracing::warn!(key, %kind, found = %tag.game, "unit was saved by another game version");
        }
        None if !unit.header.is_legacy => {
            tracing::debug!(key, %kind, "unit has no version tail");
        }
        _ => {}
    }
    Ok(unit.body)
}

fn slot_info_record(slot: &str, world: &dyn WorldHost) -> SlotInfoRecord {
    SlotInfoRecord {
        name: slot.to_owned(),
        timestamp: Utc::now(),
        region: world.level_name().to_owned(),
        players: world.participant_names(),
    }
}

impl SaveEngine {
    pub fn new(
        settings: Settings,
        backend: Arc<dyn StorageBackend>,
        types: TypeRegistry,
        schemas: SchemaRegistry,
    ) -> Self {
        let types = types.with_redirects(&settings.class_redirects);
        Self {
            settings,
            backend,
            types: Arc::new(types),
            schemas,
            selection: Selection::new(),
            operations: OperationRegistry::new(),
            session: None,
            regions: RegionTracker::new(),
            partition_save: Debounce::new(SHORT_DELAY),
            partition_load: Debounce::new(SHORT_DELAY),
            pending: None,
            last_report: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn schemas_mut(&mut self) -> &mut SchemaRegistry {
        &mut self.schemas
    }

    pub fn session(&mut self) -> &Session {
        session_of(&mut self.session, &self.settings)
    }

    /// A level load is still being reconciled.
    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// Outcomes of the most recently completed level load.
    pub fn last_report(&self) -> Option<&LoadReport> {
        self.last_report.as_ref()
    }

    fn admit(&self, world: &dyn WorldHost, mode: OperationMode, direction: Direction) -> Result<OperationTicket> {
        self.operations
            .try_begin(world.is_paused(), mode, direction)
            .map_err(|rejection| match rejection {
                Rejection::Paused => PersistError::PausedRejected,
                Rejection::Overlap(active) => PersistError::ConcurrentOperationRejected(active),
            })
    }

    fn settle(&mut self, outcome: Result<bool>, what: &str) -> Result<bool> {
        match outcome {
            Ok(done) => Ok(done),
            Err(e) if e.is_benign() => {
                tracing::debug!(error = %e, "{what} skipped");
                Ok(false)
            }
            Err(e) => {
                let slot = self.session().slot().to_owned();
                tracing::error!(%slot, error = %e, "{what} failed");
                Err(e)
            }
        }
    }

    fn reconciler(&self, format: FormatVersion) -> Reconciler {
        Reconciler::new(
            &self.settings,
            ObjectCodec::new(&self.settings, format),
            Arc::clone(&self.types),
        )
    }

    // ---- save ----

    /// Save the player side, the level side, or both into the current slot.
    /// Also refreshes the slot's info record.
    pub fn capture_session_snapshot(&mut self, world: &mut dyn WorldHost, player: bool, level: bool) -> Result<bool> {
        let Some(mode) = OperationMode::from_flags(player, level) else {
            return Ok(false);
        };
        let outcome = self
            .admit(world, mode, Direction::Save)
            .and_then(|_ticket| self.capture_inner(world, mode));
        self.settle(outcome, "save")
    }

    fn capture_inner(&mut self, world: &mut dyn WorldHost, mode: OperationMode) -> Result<bool> {
        if mode.includes_level() {
            prepare_entities(world, &self.settings, &mut self.schemas, None, &self.selection);
        }
        let settings = &self.settings;
        let backend = self.backend.as_ref();
        let session = session_of(&mut self.session, settings);
        let slot = session.slot().to_owned();
        let layout = session.layout().clone();
        let capturer = Capturer {
            codec: ObjectCodec::new(settings, FormatVersion::CURRENT),
            schemas: &self.schemas,
            names: NamePolicy::new(settings),
            raw_objects: &session.raw_objects,
        };

        // Everything is composed and encoded before the first put, against a
        // scratch copy of region memory that replaces the session's only once
        // every unit is stored.
        let mut memory = session.memory.clone();
        let mut units = Vec::with_capacity(3);

        if mode.includes_level() {
            let mut capture = capturer.level(world, &self.selection.snapshot())?;
            for record in session.partition_records.iter().chain(session.destroyed.iter()) {
                if !capture.entities.iter().any(|e| e.same_identity(record)) {
                    capture.entities.push(record.clone());
                }
            }
            let entities = capture.entities.len();
            let body = compose_level(settings, &mut memory, capture)?;
            units.push((Artifact::Level, ArchiveKind::Level, encode_unit(settings, &body)?));
            tracing::debug!(%slot, entities, "level captured");
        }

        if mode.includes_player() {
            if let Some(archive) = capturer.player(world)? {
                let body = compose_player(settings, &mut memory, &archive)?;
                units.push((Artifact::Player, ArchiveKind::Player, encode_unit(settings, &body)?));
            }
        }

        let info = slot_info_record(&slot, &*world);
        units.push((Artifact::Slot, ArchiveKind::Slot, encode_unit(settings, &to_body(&info)?)?));

        for (artifact, kind, unit) in &units {
            let key = layout.slot_key(&slot, *artifact);
            backend.put(&key, unit)?;
            tracing::debug!(%key, %kind, bytes = unit.len(), "stored unit");
        }

        session.memory = memory;
        if mode.includes_level() {
            session.partition_records.clear();
        }
        session.slots.insert(slot.clone(), info);
        tracing::info!(%slot, %mode, "session saved");
        Ok(true)
    }

    // ---- load ----

    /// Restore the player side, the level side, or both from the current slot.
    ///
    /// Player data, level scripts, mode and state are applied before this
    /// returns. Entity reconciliation runs per the configured load method;
    /// `task` is told once it completes. Returns `Ok(false)` when nothing was
    /// stored or the operation was rejected, and `task` is then dropped
    /// without being called.
    pub fn restore_session_snapshot(
        &mut self,
        world: &mut dyn WorldHost,
        player: bool,
        level: bool,
        full_reload: bool,
        task: Option<Box<dyn LoadTask>>,
    ) -> Result<bool> {
        let Some(mode) = OperationMode::from_flags(player, level) else {
            return Ok(false);
        };
        let outcome = self
            .admit(world, mode, Direction::Load)
            .and_then(|ticket| self.restore_inner(world, mode, full_reload, task, ticket));
        self.settle(outcome, "load")
    }

    fn restore_inner(
        &mut self,
        world: &mut dyn WorldHost,
        mode: OperationMode,
        full_reload: bool,
        task: Option<Box<dyn LoadTask>>,
        ticket: OperationTicket,
    ) -> Result<bool> {
        let flags = ReloadFlags {
            player: mode.includes_player(),
            level: mode.includes_level(),
        };
        prepare_entities(world, &self.settings, &mut self.schemas, Some((full_reload, flags)), &self.selection);
        let level_name = world.level_name().to_owned();
        let mut restored = false;

        if mode.includes_player() {
            if let Some(archive) = self.load_player(&level_name)? {
                let format = self.session().loaded.format();
                let reconciler = self.reconciler(format);
                apply_player(world, &self.settings, &reconciler, &archive)?;
                session_of(&mut self.session, &self.settings).payloads.player = archive;
                restored = true;
            }
        }

        let mut task = task;
        if mode.includes_level() {
            if let Some(records) = self.load_level(world, &level_name)? {
                let names = NamePolicy::new(&self.settings);
                let index: HashMap<String, EntityId> = self
                    .selection
                    .snapshot()
                    .into_iter()
                    .filter_map(|id| world.entity(id).map(|view| (names.full_name(&view), id)))
                    .collect();
                let format = self.session().loaded.format();
                let reconciler = self.reconciler(format);
                let mut pending = PendingLoad::start(
                    reconciler,
                    self.settings.load_method,
                    self.settings.deferred_batch_size,
                    records,
                    index,
                    task.take(),
                    Some(ticket),
                );
                if self.settings.load_method == LoadMethod::Immediate {
                    pending.finish_blocking(world);
                    self.last_report = Some(pending.report().clone());
                } else {
                    self.pending = Some(pending);
                }
                return Ok(true);
            }
        }

        if restored {
            if let Some(task) = task {
                task.finish(&LoadReport::default());
            }
        }
        Ok(restored)
    }

    fn load_player(&mut self, level_name: &str) -> Result<Option<PlayerArchive>> {
        let settings = &self.settings;
        let session = session_of(&mut self.session, settings);
        let key = session.layout().slot_key(session.slot(), Artifact::Player);
        let body = match load_unit(self.backend.as_ref(), settings, session, &key, ArchiveKind::Player) {
            Ok(body) => body,
            Err(PersistError::StorageMissing { .. }) => {
                tracing::debug!(key, "no player archive");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        decompose_player(settings, &mut session.memory, level_name, &body)
    }

    /// Unpack the level unit and apply scripts, mode and state. Returns the
    /// entity records left for reconciliation.
    fn load_level(&mut self, world: &mut dyn WorldHost, level_name: &str) -> Result<Option<Vec<SavedEntityRecord>>> {
        let settings = &self.settings;
        let session = session_of(&mut self.session, settings);
        let key = session.layout().slot_key(session.slot(), Artifact::Level);
        let body = match load_unit(self.backend.as_ref(), settings, session, &key, ArchiveKind::Level) {
            Ok(body) => body,
            Err(PersistError::StorageMissing { .. }) => {
                tracing::debug!(key, "no level archive");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let content = decompose_level(settings, &mut session.memory, level_name, &body)?;
        session.payloads.mode = content.mode.clone();
        session.payloads.state = content.state.clone();
        let format = session.loaded.format();
        let reconciler = self.reconciler(format);

        for script in &content.scripts {
            let target = world.entity_ids().into_iter().find(|id| {
                world
                    .entity(*id)
                    .is_some_and(|v| classify(&v) == EntityKind::LevelScript && v.region == script.region)
            });
            match target {
                Some(id) => reconciler.apply_payload(world, id, EntityKind::LevelScript, &script.payload)?,
                None => tracing::debug!(region = %script.region, "no live script for saved region"),
            }
        }
        if let Some(id) = world.mode_controller() {
            reconciler.apply_payload(world, id, EntityKind::GameObject, &content.mode)?;
        }
        if let Some(id) = world.state_controller() {
            reconciler.apply_payload(world, id, EntityKind::GameObject, &content.state)?;
        }

        let mut records = content.entities;
        if world.has_authority() {
            if let Some(viewer) = world.viewer_location() {
                sort_by_distance(&mut records, viewer);
            }
        }
        Ok(Some(records))
    }

    /// Advance background work: auto-destroy bookkeeping, world-partition
    /// batches and a pending level load. Call once per host tick.
    pub fn tick(&mut self, world: &mut dyn WorldHost) -> Result<()> {
        let events = world.drain_events();
        if self.settings.auto_destroy {
            let names = NamePolicy::new(&self.settings);
            let session = session_of(&mut self.session, &self.settings);
            for event in events {
                if let WorldEvent::Destroyed { view } = event {
                    if let Some(record) = destroyed_record(&names, &view) {
                        tracing::debug!(entity = %record.name, "remembering destroyed entity");
                        replace_or_push_entity(&mut session.destroyed, record);
                    }
                }
            }
        }

        if let Some(pending) = &mut self.pending {
            if pending.tick(world) {
                self.last_report = Some(pending.report().clone());
                self.pending = None;
            }
        }

        if self.settings.partition_active() {
            self.tick_partition(world)?;
        }
        Ok(())
    }

    /// Run a pending level load to completion now.
    pub fn finish_blocking(&mut self, world: &mut dyn WorldHost) {
        if let Some(mut pending) = self.pending.take() {
            pending.finish_blocking(world);
            self.last_report = Some(pending.report().clone());
        }
    }

    // ---- world partition ----

    fn tick_partition(&mut self, world: &mut dyn WorldHost) -> Result<()> {
        let now = world.time_seconds();
        let delta = self.regions.update(&world.loaded_regions());
        let settling = now < LONG_DELAY;
        for region in &delta.shown {
            if settling && self.settings.world_partition == WorldPartitionMethod::SkipInitial {
                tracing::debug!(%region, "region shown during settling window, ignored");
                continue;
            }
            if region_has_loadable(&*world, region) {
                self.partition_load.trigger(now);
            }
        }

        let busy = self.operations.is_active(Direction::Load) || self.operations.is_active(Direction::Save);
        if self.partition_load.poll(now, busy) {
            tracing::debug!("partition load firing");
            self.restore_session_snapshot(world, false, true, false, None)?;
        }
        // Saves wait for loads, never the other way round.
        let loading = self.operations.is_active(Direction::Load) || self.partition_load.is_armed();
        if self.partition_save.poll(now, loading) {
            tracing::debug!("partition save firing");
            self.capture_session_snapshot(world, false, true)?;
        }
        Ok(())
    }

    /// Capture the placed entities of `region` before it streams out and
    /// schedule a level save. The host calls this while the region's entities
    /// are still alive. Returns how many entities were captured.
    pub fn region_unloading(&mut self, world: &mut dyn WorldHost, region: &str) -> Result<usize> {
        let now = world.time_seconds();
        if !self.settings.partition_saves_on_hide() || now < LONG_DELAY {
            return Ok(0);
        }
        if self.settings.auto_save_structs {
            for id in world.entity_ids() {
                if let Some(view) = world.entity(id).filter(|v| v.region == region) {
                    self.schemas.propagate(&view.class_path);
                }
            }
        }
        let settings = &self.settings;
        let session = session_of(&mut self.session, settings);
        let capturer = Capturer {
            codec: ObjectCodec::new(settings, FormatVersion::CURRENT),
            schemas: &self.schemas,
            names: NamePolicy::new(settings),
            raw_objects: &session.raw_objects,
        };
        let records = capturer.region_placed(world, region)?;
        let count = records.len();
        if count == 0 {
            return Ok(0);
        }
        for record in records {
            replace_or_push_entity(&mut session.partition_records, record);
        }
        self.partition_save.trigger(now);
        tracing::debug!(region, count, "captured region before stream-out");
        Ok(count)
    }

    // ---- raw objects ----

    /// Attach `fields` under `object_id` to a player-side or mode/state
    /// entity. It is written with that entity on the next save. Level
    /// entities are refused.
    pub fn save_raw_object(&mut self, world: &dyn WorldHost, id: EntityId, object_id: &str, fields: &FieldBag) -> Result<bool> {
        let Some(view) = world.entity(id) else {
            return Ok(false);
        };
        let kind = classify(&view);
        if kind.is_level_kind(true) {
            tracing::warn!(entity = %view.name, "raw objects are not supported on level entities");
            return Ok(false);
        }
        let codec = ObjectCodec::new(&self.settings, FormatVersion::CURRENT);
        let record = ComponentRecord {
            name: raw_object_key(object_id),
            relative: Transform::IDENTITY,
            data: codec.encode_fields(TagSubject::Component, fields)?,
        };
        let session = session_of(&mut self.session, &self.settings);
        let list = session.raw_objects.entry(id).or_default();
        match list.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => list.push(record),
        }
        Ok(true)
    }

    /// Fields stored under `object_id` for `id` by the last load.
    pub fn load_raw_object(&mut self, world: &dyn WorldHost, id: EntityId, object_id: &str) -> Result<Option<FieldBag>> {
        let Some(view) = world.entity(id) else {
            return Ok(None);
        };
        if classify(&view).is_level_kind(true) {
            tracing::warn!(entity = %view.name, "raw objects are not supported on level entities");
            return Ok(None);
        }
        let session = session_of(&mut self.session, &self.settings);
        let format = session.loaded.format();
        let payloads = &session.payloads;
        let payload = if Some(id) == world.player_controller() {
            &payloads.player.controller.payload
        } else if Some(id) == world.player_pawn() {
            &payloads.player.pawn.payload
        } else if Some(id) == world.player_state() {
            &payloads.player.player_state
        } else if Some(id) == world.mode_controller() {
            &payloads.mode
        } else if Some(id) == world.state_controller() {
            &payloads.state
        } else {
            return Ok(None);
        };
        match payload.raw_object(object_id) {
            Some(record) => Ok(Some(
                ObjectCodec::new(&self.settings, format).decode(TagSubject::Component, &record.data)?,
            )),
            None => Ok(None),
        }
    }

    // ---- slots and users ----

    pub fn current_slot(&mut self) -> String {
        self.session().slot().to_owned()
    }

    /// Select the slot later saves and loads use. Returns the sanitized name.
    pub fn set_current_slot(&mut self, name: &str) -> String {
        let settings = &self.settings;
        session_of(&mut self.session, settings).set_slot(settings, name).to_owned()
    }

    pub fn list_slots(&mut self) -> Result<Vec<String>> {
        let backend = self.backend.as_ref();
        let session = session_of(&mut self.session, &self.settings);
        SlotDirectory::new(backend, session.layout()).list_slots()
    }

    /// Delete a slot's artifacts and any slot-scoped custom objects cached for
    /// it. Returns the number of blobs removed.
    pub fn delete_slot(&mut self, name: &str) -> Result<usize> {
        let slot = sanitize_name(name);
        if slot.is_empty() {
            return Ok(0);
        }
        let backend = self.backend.as_ref();
        let session = session_of(&mut self.session, &self.settings);
        let doomed: Vec<String> = session
            .custom
            .iter()
            .filter(|(key, entry)| key.contains(&slot) && entry.slot() == Some(slot.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        let extra: Vec<String> = doomed
            .iter()
            .filter_map(|key| session.custom.get(key))
            .map(|entry| session.layout().custom_key(entry.save_name(), entry.slot()))
            .collect();
        let removed = SlotDirectory::new(backend, session.layout()).delete_slot(&slot, &extra)?;
        for key in &doomed {
            session.custom.remove(key);
        }
        session.slots.remove(&slot);
        if session.slot() == slot {
            session.clear_region_memory();
        }
        Ok(removed)
    }

    pub fn list_users(&mut self) -> Result<Vec<String>> {
        let backend = self.backend.as_ref();
        let session = session_of(&mut self.session, &self.settings);
        SlotDirectory::new(backend, session.layout()).list_users()
    }

    /// Move to another save user's namespace. `None` selects the shared one.
    /// Refused on flat-namespace backends.
    pub fn switch_user(&mut self, user: Option<&str>) -> Result<bool> {
        if self.settings.is_flat_namespace() {
            tracing::warn!("save users are not available on flat-namespace backends");
            return Ok(false);
        }
        let settings = &self.settings;
        Ok(session_of(&mut self.session, settings).set_user(settings, user))
    }

    pub fn delete_user(&mut self, user: &str) -> Result<usize> {
        let user = sanitize_name(user);
        let backend = self.backend.as_ref();
        let session = session_of(&mut self.session, &self.settings);
        SlotDirectory::new(backend, session.layout()).delete_user(&user)
    }

    /// Info record of `slot`, or of the current slot. Cached after first read.
    pub fn slot_info(&mut self, slot: Option<&str>) -> Result<Option<SlotInfoRecord>> {
        let settings = &self.settings;
        let session = session_of(&mut self.session, settings);
        let slot = match slot {
            Some(s) if !s.is_empty() => sanitize_name(s),
            _ => session.slot().to_owned(),
        };
        if let Some(info) = session.slots.get(&slot) {
            return Ok(Some(info.clone()));
        }
        let key = session.layout().slot_key(&slot, Artifact::Slot);
        let bytes = match self.backend.get(&key) {
            Ok(bytes) => bytes,
            Err(PersistError::StorageMissing { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let info: SlotInfoRecord = from_body(&decode_unit(settings, &bytes, ArchiveKind::Slot)?.body, ArchiveKind::Slot)?;
        session.slots.insert(slot, info.clone());
        Ok(Some(info))
    }

    pub fn slot_exists(&mut self, slot: &str) -> Result<bool> {
        Ok(self.slot_info(Some(slot))?.is_some())
    }

    /// Write the current slot's info record.
    pub fn save_slot_info(&mut self, world: &dyn WorldHost) -> Result<()> {
        let settings = &self.settings;
        let session = session_of(&mut self.session, settings);
        let slot = session.slot().to_owned();
        let info = slot_info_record(&slot, world);
        let key = session.layout().slot_key(&slot, Artifact::Slot);
        store_unit(self.backend.as_ref(), settings, &key, &to_body(&info)?, ArchiveKind::Slot)?;
        session.slots.insert(slot, info);
        Ok(())
    }

    // ---- custom objects ----

    fn custom_slot<T: CustomSave>(&mut self, slot: Option<&str>) -> Result<Option<String>> {
        if !T::USE_SLOT {
            return Ok(None);
        }
        match slot.filter(|s| !s.is_empty()) {
            Some(requested) => {
                let requested = sanitize_name(requested);
                if !self.slot_exists(&requested)? {
                    tracing::warn!(object = T::SAVE_NAME, slot = %requested, "slot does not exist");
                    let key = self.session().layout().slot_key(&requested, Artifact::Slot);
                    return Err(PersistError::StorageMissing { key });
                }
                Ok(Some(requested))
            }
            None => Ok(Some(self.current_slot())),
        }
    }

    /// The cached custom object of type `T`, loading it or starting from its
    /// default on first access. `slot` picks a slot other than the current
    /// one for slot-scoped types and must exist.
    pub fn custom_object<T: CustomSave>(&mut self, slot: Option<&str>) -> Result<&mut T> {
        let slot = self.custom_slot::<T>(slot)?;
        let key = cache_key(T::SAVE_NAME, slot.as_deref());
        let settings = &self.settings;
        let session = session_of(&mut self.session, settings);
        let storage_key = session.layout().custom_key(T::SAVE_NAME, slot.as_deref());
        let entry = match session.custom.entry(key) {
            Entry::Occupied(cached) => cached.into_mut(),
            Entry::Vacant(vacant) => {
                let value = match self.backend.get(&storage_key) {
                    Ok(bytes) => decode_body::<T>(&decode_unit(settings, &bytes, ArchiveKind::Object)?.body)?,
                    Err(PersistError::StorageMissing { .. }) => T::default(),
                    Err(e) => return Err(e),
                };
                vacant.insert(Box::new(CustomEntry { value, slot }))
            }
        };
        downcast::<T>(entry.as_mut())
    }

    /// Write the cached custom object of type `T`.
    pub fn save_custom_object<T: CustomSave>(&mut self, slot: Option<&str>) -> Result<bool> {
        let outcome = self.save_custom_inner::<T>(slot);
        self.settle(outcome, "custom object save")
    }

    fn save_custom_inner<T: CustomSave>(&mut self, slot: Option<&str>) -> Result<bool> {
        self.custom_object::<T>(slot)?;
        let resolved = self.custom_slot::<T>(slot)?;
        let settings = &self.settings;
        let session = session_of(&mut self.session, settings);
        let key = cache_key(T::SAVE_NAME, resolved.as_deref());
        let Some(entry) = session.custom.get(&key) else {
            return Ok(false);
        };
        let storage_key = session.layout().custom_key(T::SAVE_NAME, resolved.as_deref());
        store_unit(self.backend.as_ref(), settings, &storage_key, &entry.encode_body()?, ArchiveKind::Object)?;
        tracing::info!(object = T::SAVE_NAME, key = %storage_key, "custom object saved");
        Ok(true)
    }

    /// Write every cached custom object. Refreshes the slot info when any of
    /// them is slot-scoped. Returns how many were written.
    pub fn save_all_custom_objects(&mut self, world: &dyn WorldHost) -> Result<usize> {
        let settings = &self.settings;
        let backend = self.backend.as_ref();
        let session = session_of(&mut self.session, settings);
        let mut saved = 0;
        let mut slot_scoped = false;
        for entry in session.custom.values() {
            let key = session.layout().custom_key(entry.save_name(), entry.slot());
            store_unit(backend, settings, &key, &entry.encode_body()?, ArchiveKind::Object)?;
            slot_scoped |= entry.slot().is_some();
            saved += 1;
        }
        if slot_scoped {
            self.save_slot_info(world)?;
        }
        tracing::info!(saved, "custom objects saved");
        Ok(saved)
    }

    /// Remove the stored and cached custom object of type `T`.
    pub fn delete_custom_object<T: CustomSave>(&mut self, slot: Option<&str>) -> Result<bool> {
        let resolved = match self.custom_slot::<T>(slot) {
            Ok(resolved) => resolved,
            Err(e) if e.is_benign() => return Ok(false),
            Err(e) => return Err(e),
        };
        let session = session_of(&mut self.session, &self.settings);
        let storage_key = session.layout().custom_key(T::SAVE_NAME, resolved.as_deref());
        session.custom.remove(&cache_key(T::SAVE_NAME, resolved.as_deref()));
        self.backend.delete(&storage_key)
    }

    // ---- version checks ----

    /// Start a version check: forget earlier results and read the version
    /// tail of the current slot's `kind` unit. For objects, every cached
    /// custom object is read. Returns whether any tail was found.
    pub fn check_save_version(&mut self, kind: ArchiveKind) -> Result<bool> {
        let session = session_of(&mut self.session, &self.settings);
        session.ledger.clear();
        let layout = session.layout();
        let keys: Vec<String> = match kind {
            ArchiveKind::Player => vec![layout.slot_key(session.slot(), Artifact::Player)],
            ArchiveKind::Level => vec![layout.slot_key(session.slot(), Artifact::Level)],
            ArchiveKind::Slot => vec![layout.slot_key(session.slot(), Artifact::Slot)],
            ArchiveKind::Object => session
                .custom
                .values()
                .map(|e| layout.custom_key(e.save_name(), e.slot()))
                .collect(),
        };
        self.read_versions(keys.into_iter().map(|k| (kind, k)).collect())
    }

    /// Start a version check over the player, level and slot units of the
    /// current slot.
    pub fn check_slot_versions(&mut self) -> Result<bool> {
        let session = session_of(&mut self.session, &self.settings);
        session.ledger.clear();
        let layout = session.layout();
        let units = [
            (ArchiveKind::Player, Artifact::Player),
            (ArchiveKind::Level, Artifact::Level),
            (ArchiveKind::Slot, Artifact::Slot),
        ]
        .into_iter()
        .map(|(kind, artifact)| (kind, layout.slot_key(session.slot(), artifact)))
        .collect();
        self.read_versions(units)
    }

    fn read_versions(&mut self, units: Vec<(ArchiveKind, String)>) -> Result<bool> {
        let settings = &self.settings;
        let session = session_of(&mut self.session, settings);
        let mut found = false;
        for (kind, key) in units {
            let bytes = match self.backend.get(&key) {
                Ok(bytes) => bytes,
                Err(PersistError::StorageMissing { .. }) => continue,
                Err(e) => return Err(e),
            };
            if let Some(tag) = decode_unit(settings, &bytes, kind)?.tag {
                session.ledger.record(kind, tag);
                found = true;
            }
        }
        Ok(found)
    }

    /// Finish a version check: true only when every unit read agrees and
    /// matches the configured game version.
    pub fn complete_version_check(&mut self) -> bool {
        let expected = version_tag(&self.settings).game;
        let ok = session_of(&mut self.session, &self.settings).ledger.verify(&expected);
        if ok {
            tracing::info!(game = %expected, "save versions verified");
        }
        ok
    }

    /// Forget everything remembered about visited regions.
    pub fn clear_region_memory(&mut self) {
        session_of(&mut self.session, &self.settings).clear_region_memory();
        self.regions.clear();
    }
}

fn region_has_loadable(world: &dyn WorldHost, region: &str) -> bool {
    world.entity_ids().into_iter().any(|id| {
        world
            .entity(id)
            .is_some_and(|v| v.region == region && v.supports_persistence() && !v.has_tag(tags::SKIP_SAVE))
    })
}

/// Restore the local player from `archive`.
fn apply_player(
    world: &mut dyn WorldHost,
    settings: &Settings,
    reconciler: &Reconciler,
    archive: &PlayerArchive,
) -> Result<()> {
    let keep_transform = settings.persistent_player_applies();
    if let Some(view) = world.player_controller().and_then(|id| world.entity(id)) {
        let rotation = archive.controller.rotation;
        if !keep_transform && !view.has_tag(tags::SKIP_TRANSFORM) && !rotation_nearly_zero(rotation) {
            world.set_control_rotation(rotation);
        }
        reconciler.apply_payload(world, view.id, EntityKind::PlayerActor, &archive.controller.payload)?;
    }
    if let Some(view) = world.player_pawn().and_then(|id| world.entity(id)) {
        if !view.has_tag(tags::PAWN_AS_LEVEL_ENTITY) {
            let pawn = &archive.pawn;
            if !keep_transform && !view.has_tag(tags::SKIP_TRANSFORM) && !position_nearly_zero(pawn.position) {
                let transform = Transform {
                    position: pawn.position,
                    rotation: pawn.rotation,
                    scale: view.transform.scale,
                };
                world.set_transform(view.id, transform);
            }
            reconciler.apply_payload(world, view.id, EntityKind::PlayerPawn, &pawn.payload)?;
        }
    }
    if let Some(id) = world.player_state() {
        reconciler.apply_payload(world, id, EntityKind::PlayerActor, &archive.player_state)?;
    }
    tracing::debug!(region = %archive.region, "player restored");
    Ok(())
}
