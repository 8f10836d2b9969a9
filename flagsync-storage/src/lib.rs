//! Versioned local caches for the flagsync engine.
//!
//! Three cache families back the synchronization engine:
//!
//! - [`SplitsCache`] — split (feature flag) definitions, one change number
//!   for the whole collection
//! - [`SegmentsCache`] — segment key sets, one change number per segment
//! - [`MembershipsCache`] — per-user-key segment memberships, one change
//!   number per key
//!
//! All writes are guarded by change-number monotonicity: stale data is
//! dropped silently, never applied. The bundled implementations are
//! in-memory; the traits are the seam for pluggable backends.

mod error;
mod memberships;
mod model;
mod segments;
mod splits;

pub use error::{StorageError, StorageResult};
pub use memberships::{InMemoryMembershipsCache, MembershipsCache};
pub use model::{Condition, Matcher, MatcherGroup, SegmentMatcherData, Split, SplitStatus};
pub use segments::{InMemorySegmentsCache, SegmentsCache};
pub use splits::{InMemorySplitsCache, SplitsCache};
