//! Streaming: region visibility bookkeeping and debounced batching.
//!
//! # Invariants
//! - A region is reported shown or hidden once per transition.
//! - A debounced batch fires at most once per burst of triggers and never
//!   while the opposite operation is active.

mod debounce;
mod region;

pub use debounce::{Debounce, LONG_DELAY, SHORT_DELAY};
pub use region::{RegionDelta, RegionStats, RegionTracker};
