//! Admission control for save and load operations.
//!
//! An operation is rejected outright, never queued, when the world is paused
//! or when another operation of an overlapping kind is in flight.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// What part of the session an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    Player,
    Level,
    All,
}

impl OperationMode {
    pub fn overlaps(self, other: OperationMode) -> bool {
        self == other || self == OperationMode::All || other == OperationMode::All
    }

    pub fn from_flags(player: bool, level: bool) -> Option<Self> {
        match (player, level) {
            (true, true) => Some(OperationMode::All),
            (true, false) => Some(OperationMode::Player),
            (false, true) => Some(OperationMode::Level),
            (false, false) => None,
        }
    }

    pub fn includes_player(self) -> bool {
        matches!(self, OperationMode::Player | OperationMode::All)
    }

    pub fn includes_level(self) -> bool {
        matches!(self, OperationMode::Level | OperationMode::All)
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationMode::Player => "player",
            OperationMode::Level => "level",
            OperationMode::All => "player+level",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Save,
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveOperation {
    id: u64,
    mode: OperationMode,
    direction: Direction,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    active: Vec<ActiveOperation>,
}

/// Registry of in-flight operations for one world. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an operation or say why not. The returned ticket releases the
    /// admission when dropped.
    pub fn try_begin(
        &self,
        paused: bool,
        mode: OperationMode,
        direction: Direction,
    ) -> Result<OperationTicket, Rejection> {
        if paused {
            tracing::warn!(%mode, ?direction, "operation rejected: world is paused");
            return Err(Rejection::Paused);
        }
        let mut inner = self.inner.lock();
        if let Some(busy) = inner.active.iter().find(|op| op.mode.overlaps(mode)) {
            tracing::warn!(
                %mode,
                ?direction,
                active = %busy.mode,
                active_direction = ?busy.direction,
                "operation rejected: overlapping operation in flight"
            );
            return Err(Rejection::Overlap(busy.mode));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.active.push(ActiveOperation {
            id,
            mode,
            direction,
        });
        Ok(OperationTicket {
            registry: self.clone(),
            id,
            mode,
            direction,
        })
    }

    /// Is any operation in `direction` running?
    pub fn is_active(&self, direction: Direction) -> bool {
        self.inner
            .lock()
            .active
            .iter()
            .any(|op| op.direction == direction)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    fn release(&self, id: u64) {
        self.inner.lock().active.retain(|op| op.id != id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Paused,
    Overlap(OperationMode),
}

/// Proof of admission. Dropping it ends the operation.
#[derive(Debug)]
pub struct OperationTicket {
    registry: OperationRegistry,
    id: u64,
    mode: OperationMode,
    direction: Direction,
}

impl OperationTicket {
    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl Drop for OperationTicket {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_world_rejects_everything() {
        let ops = OperationRegistry::new();
        assert_eq!(
            ops.try_begin(true, OperationMode::Player, Direction::Save)
                .unwrap_err(),
            Rejection::Paused
        );
        assert_eq!(ops.active_count(), 0);
    }

    #[test]
    fn overlapping_kinds_are_rejected() {
        let ops = OperationRegistry::new();
        let level = ops
            .try_begin(false, OperationMode::Level, Direction::Load)
            .unwrap();
        assert_eq!(
            ops.try_begin(false, OperationMode::Level, Direction::Save)
                .unwrap_err(),
            Rejection::Overlap(OperationMode::Level)
        );
        assert!(
            ops.try_begin(false, OperationMode::All, Direction::Save)
                .is_err()
        );
        let player = ops
            .try_begin(false, OperationMode::Player, Direction::Save)
            .unwrap();
        assert!(ops.is_active(Direction::Load));
        assert!(ops.is_active(Direction::Save));
        drop(level);
        drop(player);
        assert_eq!(ops.active_count(), 0);
        assert!(
            ops.try_begin(false, OperationMode::All, Direction::Load)
                .is_ok()
        );
    }

    #[test]
    fn mode_from_flags() {
        assert_eq!(OperationMode::from_flags(true, true), Some(OperationMode::All));
        assert_eq!(OperationMode::from_flags(false, false), None);
        assert!(OperationMode::All.includes_player());
        assert!(!OperationMode::Level.includes_player());
    }
}
