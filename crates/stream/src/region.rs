use std::collections::BTreeSet;

/// What changed between two region visibility updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionDelta {
    pub shown: Vec<String>,
    pub hidden: Vec<String>,
}

impl RegionDelta {
    pub fn is_empty(&self) -> bool {
        self.shown.is_empty() && self.hidden.is_empty()
    }
}

/// Per-update streaming statistics for instrumentation.
#[derive(Debug, Clone, Default)]
pub struct RegionStats {
    pub shown_this_update: usize,
    pub hidden_this_update: usize,
    pub total_loaded: usize,
    /// Regions ever seen loaded in this session.
    pub total_visited: usize,
}

/// Tracks which streaming sub-regions are loaded and which were visited at
/// least once this session.
#[derive(Debug, Default)]
pub struct RegionTracker {
    loaded: BTreeSet<String>,
    visited: BTreeSet<String>,
    stats: RegionStats,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the tracked set against the regions the world reports as
    /// loaded right now. Returns what appeared and what went away.
    pub fn update<S: AsRef<str>>(&mut self, loaded_now: &[S]) -> RegionDelta {
        let current: BTreeSet<String> = loaded_now.iter().map(|s| s.as_ref().to_owned()).collect();

        let shown: Vec<String> = current.difference(&self.loaded).cloned().collect();
        let hidden: Vec<String> = self.loaded.difference(&current).cloned().collect();

        for r in &shown {
            tracing::debug!(region = %r, "region shown");
            self.visited.insert(r.clone());
        }
        for r in &hidden {
            tracing::debug!(region = %r, "region hidden");
        }
        self.loaded = current;

        self.stats = RegionStats {
            shown_this_update: shown.len(),
            hidden_this_update: hidden.len(),
            total_loaded: self.loaded.len(),
            total_visited: self.visited.len(),
        };

        tracing::trace!(
            shown = shown.len(),
            hidden = hidden.len(),
            total = self.loaded.len(),
            "region update complete"
        );

        RegionDelta { shown, hidden }
    }

    /// Check if a region is currently loaded.
    pub fn is_loaded(&self, region: &str) -> bool {
        self.loaded.contains(region)
    }

    /// True if the region has been loaded at any point this session.
    pub fn was_visited(&self, region: &str) -> bool {
        self.visited.contains(region)
    }

    pub fn loaded(&self) -> impl Iterator<Item = &str> {
        self.loaded.iter().map(String::as_str)
    }

    /// Get statistics from the last update.
    pub fn stats(&self) -> &RegionStats {
        &self.stats
    }

    /// Forget everything, as at session start.
    pub fn clear(&mut self) {
        self.loaded.clear();
        self.visited.clear();
        self.stats = RegionStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_update_shows_everything() {
        let mut tracker = RegionTracker::new();
        let delta = tracker.update(&["A", "B"]);
        assert_eq!(delta.shown, vec!["A".to_owned(), "B".to_owned()]);
        assert!(delta.hidden.is_empty());
        assert!(tracker.is_loaded("A"));
        assert_eq!(tracker.stats().total_loaded, 2);
    }

    #[test]
    fn hidden_regions_stay_visited() {
        let mut tracker = RegionTracker::new();
        tracker.update(&["A", "B"]);
        let delta = tracker.update(&["B"]);
        assert_eq!(delta.hidden, vec!["A".to_owned()]);
        assert!(delta.shown.is_empty());
        assert!(!tracker.is_loaded("A"));
        assert!(tracker.was_visited("A"));
        assert_eq!(tracker.stats().total_visited, 2);
    }

    #[test]
    fn unchanged_update_is_empty() {
        let mut tracker = RegionTracker::new();
        tracker.update(&["A"]);
        assert!(tracker.update(&["A"]).is_empty());
        let none: [&str; 0] = [];
        assert_eq!(tracker.update(&none).hidden, vec!["A".to_owned()]);
    }

    #[test]
    fn clear_forgets_visits() {
        let mut tracker = RegionTracker::new();
        tracker.update(&["A"]);
        tracker.clear();
        assert!(!tracker.was_visited("A"));
        assert_eq!(tracker.loaded().count(), 0);
    }
}
