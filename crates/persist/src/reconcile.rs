//! Matching saved records against the live world.
//!
//! Every record ends in exactly one [`Outcome`]. Decoding a record is pure and
//! may run on a worker thread; everything that touches the world happens in
//! [`PendingLoad::tick`] or [`PendingLoad::finish_blocking`], on the context
//! that owns the world.
//!
//! # Invariants
//! - An entity carrying the has-loaded marker is never updated again.
//! - One record's failure never aborts the batch.
//! - Immediate, deferred and threaded scheduling produce the same outcomes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{self, TryRecvError};
use std::thread::JoinHandle;

use glam::Vec3;
use keepsake_common::{Capabilities, EntityId, FieldBag, Transform, tags};
use keepsake_kernel::WorldHost;

use crate::admission::OperationTicket;
use crate::archive::{EntityKind, EntityPayload, SavedEntityRecord};
use crate::capture::{can_process_transform, classify, has_valid_transform};
use crate::codec::{ObjectCodec, TagSubject};
use crate::error::Result;
use crate::registry::TypeRegistry;
use crate::settings::{LoadMethod, Settings};

/// Terminal state of one saved record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Outcome {
    SkippedAlreadyLoaded,
    Updated,
    /// A destroyed-kind record removed its live counterpart.
    Destroyed,
    SpawnSucceeded,
    SpawnFailed,
    /// No live entity of the record's kind, and nothing to spawn from.
    Unmatched,
    DecodeFailed,
}

struct PreparedComponent {
    name: String,
    relative: Transform,
    fields: FieldBag,
}

/// A record decoded off the owning context.
pub(crate) struct PreparedRecord {
    name: String,
    kind: EntityKind,
    transform: Transform,
    class_path: Option<String>,
    decoded: std::result::Result<(FieldBag, Vec<PreparedComponent>), String>,
}

/// Applies saved records to a world.
#[derive(Debug, Clone)]
pub struct Reconciler {
    codec: ObjectCodec,
    types: Arc<TypeRegistry>,
    auto_destroy: bool,
    advanced_spawn_check: bool,
}

impl Reconciler {
    pub fn new(settings: &Settings, codec: ObjectCodec, types: Arc<TypeRegistry>) -> Self {
        Self {
            codec,
            types,
            auto_destroy: settings.auto_destroy,
            advanced_spawn_check: settings.advanced_spawn_check,
        }
    }

    pub(crate) fn prepare(&self, record: &SavedEntityRecord) -> PreparedRecord {
        PreparedRecord {
            name: record.name.clone(),
            kind: record.kind,
            transform: record.transform,
            class_path: record.class_path.clone().filter(|c| !c.is_empty()),
            decoded: self
                .decode(record.kind, &record.payload)
                .map_err(|e| e.to_string()),
        }
    }

    fn decode(&self, kind: EntityKind, payload: &EntityPayload) -> Result<(FieldBag, Vec<PreparedComponent>)> {
        let fields = self.codec.decode(TagSubject::Entity(kind), &payload.data)?;
        let mut components = Vec::new();
        // Raw objects ride along in the component list but are only read on request.
        for c in payload.components.iter().filter(|c| !c.is_raw_object()) {
            components.push(PreparedComponent {
                name: c.name.clone(),
                relative: c.relative,
                fields: self.codec.decode(TagSubject::Component, &c.data)?,
            });
        }
        Ok((fields, components))
    }

    /// Apply a payload that is not matched by name: scripts, mode/state
    /// controllers and player-side entities.
    pub fn apply_payload(
        &self,
        world: &mut dyn WorldHost,
        id: EntityId,
        kind: EntityKind,
        payload: &EntityPayload,
    ) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let (fields, components) = self.decode(kind, payload)?;
        world.apply_fields(id, fields);
        apply_components(world, id, components);
        Ok(())
    }

    /// Match `record` by identity name, falling back to a scene lookup when
    /// enabled, and spawn when nothing matches.
    pub(crate) fn apply(
        &self,
        world: &mut dyn WorldHost,
        index: &HashMap<String, EntityId>,
        record: PreparedRecord,
    ) -> Outcome {
        if let Some(id) = index.get(&record.name).copied().filter(|id| world.is_alive(*id)) {
            return self.process(world, id, record);
        }
        if self.advanced_spawn_check {
            if let Some(id) = world.find_by_name(&record.name) {
                tracing::debug!(entity = %record.name, "matched by scene lookup");
                return self.process(world, id, record);
            }
        }
        self.spawn(world, record)
    }

    fn process(&self, world: &mut dyn WorldHost, id: EntityId, record: PreparedRecord) -> Outcome {
        let Some(view) = world.entity(id) else {
            return Outcome::Unmatched;
        };
        if view.has_tag(tags::HAS_LOADED) {
            return Outcome::SkippedAlreadyLoaded;
        }
        if record.kind == EntityKind::Destroyed && self.auto_destroy {
            world.destroy(id);
            tracing::debug!(entity = %record.name, "destroyed entity saved as destroyed");
            return Outcome::Destroyed;
        }
        if record.kind != classify(&view) {
            tracing::debug!(entity = %record.name, saved = ?record.kind, "saved kind differs from live entity");
            return Outcome::Unmatched;
        }
        let (fields, components) = match record.decoded {
            Ok(decoded) => decoded,
            Err(reason) => {
                tracing::warn!(entity = %record.name, %reason, "failed to decode saved entity");
                return Outcome::DecodeFailed;
            }
        };
        if can_process_transform(&view) && has_valid_transform(&record.transform) {
            world.set_transform(id, record.transform);
        }
        world.add_tag(id, tags::HAS_LOADED);
        world.apply_fields(id, fields);
        apply_components(world, id, components);
        Outcome::Updated
    }

    fn spawn(&self, world: &mut dyn WorldHost, record: PreparedRecord) -> Outcome {
        let Some(class) = record.class_path.as_deref() else {
            return Outcome::Unmatched;
        };
        if let Err(reason) = &record.decoded {
            tracing::warn!(entity = %record.name, %reason, "not spawning saved entity that failed to decode");
            return Outcome::DecodeFailed;
        }
        let mut template = match self.types.resolve(class) {
            Ok(template) => template,
            Err(e) => {
                tracing::warn!(entity = %record.name, class, error = %e, "dropping record with unresolvable class");
                return Outcome::SpawnFailed;
            }
        };
        if record.kind == EntityKind::Persistent {
            template.tags.insert(tags::PERSISTENT.to_owned());
        }
        let name = record.name.clone();
        match world.spawn(template, &record.name, record.transform) {
            Ok(id) => match self.process(world, id, record) {
                Outcome::Updated => Outcome::SpawnSucceeded,
                other => {
                    // A spawned instance never outlives a failed update.
                    world.destroy(id);
                    tracing::warn!(entity = %name, outcome = ?other, "removed spawned entity that could not be updated");
                    Outcome::SpawnFailed
                }
            },
            Err(e) => {
                tracing::warn!(entity = %record.name, class, error = %e, "failed to spawn saved entity");
                Outcome::SpawnFailed
            }
        }
    }
}

/// Movable components take their saved relative transform, then their fields.
fn apply_components(world: &mut dyn WorldHost, id: EntityId, components: Vec<PreparedComponent>) {
    let live = world.components(id);
    for c in components {
        let Some(target) = live.iter().find(|l| l.name == c.name) else {
            tracing::trace!(component = %c.name, "saved component no longer exists");
            continue;
        };
        let relative = target
            .capabilities
            .contains(Capabilities::MOVABLE)
            .then_some(c.relative);
        world.apply_component(id, &c.name, relative, c.fields);
    }
}

/// Outcomes of one load pass, in the order records were applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub outcomes: Vec<(String, Outcome)>,
}

impl LoadReport {
    fn push(&mut self, name: String, outcome: Outcome) {
        self.outcomes.push((name, outcome));
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == outcome).count()
    }

    pub fn counts(&self) -> BTreeMap<Outcome, usize> {
        let mut counts = BTreeMap::new();
        for (_, outcome) in &self.outcomes {
            *counts.entry(*outcome).or_insert(0) += 1;
        }
        counts
    }

    /// Outcomes ordered by record name, for comparing passes.
    pub fn sorted(&self) -> Vec<(String, Outcome)> {
        let mut v = self.outcomes.clone();
        v.sort();
        v
    }
}

/// Notified once when a load pass completes.
pub trait LoadTask: Send {
    fn finish(self: Box<Self>, report: &LoadReport);
}

impl<F: FnOnce(&LoadReport) + Send> LoadTask for F {
    fn finish(self: Box<Self>, report: &LoadReport) {
        (*self)(report)
    }
}

/// Nearest records first. Equal distances keep their saved order.
pub fn sort_by_distance(records: &mut [SavedEntityRecord], viewer: Vec3) {
    records.sort_by(|a, b| {
        a.transform
            .position
            .distance_squared(viewer)
            .total_cmp(&b.transform.position.distance_squared(viewer))
    });
}

enum WorkerMessage {
    Record(Box<PreparedRecord>),
    Done,
}

enum Driver {
    Deferred {
        queue: VecDeque<SavedEntityRecord>,
        batch: usize,
    },
    Threaded {
        rx: mpsc::Receiver<WorkerMessage>,
        worker: Option<JoinHandle<()>>,
    },
}

/// A load pass in progress.
pub struct PendingLoad {
    reconciler: Reconciler,
    index: HashMap<String, EntityId>,
    driver: Driver,
    report: LoadReport,
    task: Option<Box<dyn LoadTask>>,
    ticket: Option<OperationTicket>,
    span: tracing::Span,
    done: bool,
}

impl std::fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLoad")
            .field("applied", &self.report.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl PendingLoad {
    /// Start reconciling `records` against the entities in `index`.
    ///
    /// Immediate scheduling is a deferred pass with an unbounded batch. A
    /// threaded pass decodes on a worker; if the worker cannot be started the
    /// pass falls back to deferred.
    pub fn start(
        reconciler: Reconciler,
        method: LoadMethod,
        batch: usize,
        records: Vec<SavedEntityRecord>,
        index: HashMap<String, EntityId>,
        task: Option<Box<dyn LoadTask>>,
        ticket: Option<OperationTicket>,
    ) -> Self {
        let span = tracing::info_span!("reconcile", ?method, records = records.len());
        let driver = match method {
            LoadMethod::Immediate => Driver::Deferred {
                queue: records.into(),
                batch: usize::MAX,
            },
            LoadMethod::Deferred => Driver::Deferred {
                queue: records.into(),
                batch: batch.max(1),
            },
            LoadMethod::Threaded => Self::spawn_worker(&reconciler, records, batch),
        };
        Self {
            reconciler,
            index,
            driver,
            report: LoadReport::default(),
            task,
            ticket,
            span,
            done: false,
        }
    }

    fn spawn_worker(reconciler: &Reconciler, records: Vec<SavedEntityRecord>, batch: usize) -> Driver {
        let (tx, rx) = mpsc::channel();
        let worker = reconciler.clone();
        let shared = Arc::new(records);
        let input = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name("keepsake-reconcile".into())
            .spawn(move || {
                for record in input.iter() {
                    if tx.send(WorkerMessage::Record(Box::new(worker.prepare(record)))).is_err() {
                        return;
                    }
                }
                let _ = tx.send(WorkerMessage::Done);
            });
        match spawned {
            Ok(handle) => Driver::Threaded {
                rx,
                worker: Some(handle),
            },
            Err(e) => {
                tracing::warn!(error = %e, "cannot start reconcile worker, falling back to deferred");
                let records = Arc::try_unwrap(shared).unwrap_or_else(|a| a.as_ref().clone());
                Driver::Deferred {
                    queue: records.into(),
                    batch: batch.max(1),
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    /// Apply what is ready without blocking. Returns true once the pass is
    /// complete.
    pub fn tick(&mut self, world: &mut dyn WorldHost) -> bool {
        self.drive(world, false)
    }

    /// Run the pass to completion on the calling context.
    pub fn finish_blocking(&mut self, world: &mut dyn WorldHost) {
        self.drive(world, true);
    }

    fn drive(&mut self, world: &mut dyn WorldHost, blocking: bool) -> bool {
        if self.done {
            return true;
        }
        let span = self.span.clone();
        let _entered = span.enter();
        let finished = match &mut self.driver {
            Driver::Deferred { queue, batch } => {
                let limit = if blocking { usize::MAX } else { *batch };
                let mut applied = 0;
                while applied < limit {
                    let Some(record) = queue.pop_front() else {
                        break;
                    };
                    let prepared = self.reconciler.prepare(&record);
                    let outcome = self.reconciler.apply(world, &self.index, prepared);
                    self.report.push(record.name, outcome);
                    applied += 1;
                }
                queue.is_empty()
            }
            Driver::Threaded { rx, .. } => loop {
                let message = if blocking {
                    rx.recv().ok()
                } else {
                    match rx.try_recv() {
                        Ok(message) => Some(message),
                        Err(TryRecvError::Empty) => break false,
                        Err(TryRecvError::Disconnected) => None,
                    }
                };
                match message {
                    Some(WorkerMessage::Record(prepared)) => {
                        let name = prepared.name.clone();
                        let outcome = self.reconciler.apply(world, &self.index, *prepared);
                        self.report.push(name, outcome);
                    }
                    Some(WorkerMessage::Done) => break true,
                    None => {
                        tracing::warn!("reconcile worker stopped before finishing");
                        break true;
                    }
                }
            },
        };
        if finished {
            self.complete();
        }
        finished
    }

    fn complete(&mut self) {
        if let Driver::Threaded { worker, .. } = &mut self.driver {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    tracing::warn!("reconcile worker panicked");
                }
            }
        }
        self.done = true;
        self.ticket = None;
        let counts = self.report.counts();
        tracing::info!(records = self.report.len(), ?counts, "level load finished");
        if let Some(task) = self.task.take() {
            task.finish(&self.report);
        }
    }
}
