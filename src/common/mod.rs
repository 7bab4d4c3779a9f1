pub mod error;

pub use error::*;

/// Unique identity of a protocol participant.
pub type ServerId = String;

/// Identity of one global snapshot run.
pub type SnapshotId = u64;
