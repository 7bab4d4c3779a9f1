use crate::common::{ServerId, SnapshotId};

use super::message::Message;

/// Capabilities the hosting scheduler lends to every server.
///
/// Servers never own the scheduler; they are handed this capability at
/// construction and use it to stamp outgoing events with a delivery time,
/// to report when their local recording for a snapshot has finished, and to
/// surface sent messages for tracing. Received messages are not reported:
/// the scheduler observes those itself at delivery.
pub trait SnapshotContext: Send + Sync {
    /// Delivery time to stamp on an event enqueued now.
    fn receive_time(&self) -> u64;

    /// Fired exactly once per (server, snapshot) when that server's local
    /// recording finishes.
    fn notify_snapshot_complete(&self, server_id: &ServerId, snapshot_id: SnapshotId);

    /// Observability hook for every message a server puts on a link.
    fn record_sent(&self, src: &ServerId, dest: &ServerId, message: &Message);
}
