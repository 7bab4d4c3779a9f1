use thiserror::Error;

use crate::common::{ServerId, SnapshotId};

/// Failures surfaced by the snapshot core and the scheduler.
///
/// Every variant indicates a mis-wired topology or a caller bug, never a
/// runtime condition to retry; the protocol assumes a closed, correctly
/// wired network.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    #[error("server {server} attempted to send {requested} tokens while holding {held}")]
    Overdraft {
        server: ServerId,
        requested: u64,
        held: u64,
    },

    #[error("unknown destination {dest} from server {src}")]
    UnknownDestination { src: ServerId, dest: ServerId },

    #[error("unknown server id {0}")]
    UnknownServer(ServerId),

    #[error("snapshot {snapshot_id} did not complete within the tick budget")]
    SnapshotStalled { snapshot_id: SnapshotId },
}
