use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::common::{ServerId, SimError, SnapshotId};

use super::context::SnapshotContext;
use super::link::{Link, SendEvent};
use super::message::{MarkerMessage, Message, SnapshotMessage, TokenMessage};
use super::state::{SnapshotState, SnapshotStore};

/// The main participant of the distributed snapshot protocol.
///
/// Servers exchange token messages and marker messages among each other.
/// Token messages move tokens between servers; marker messages carry the
/// progress of a snapshot. The bulk of the protocol lives in
/// [`Server::handle_packet`] and [`Server::start_snapshot`].
pub struct Server {
    pub id: ServerId,
    pub tokens: u64,
    ctx: Arc<dyn SnapshotContext>,
    /// key = link.dest
    outbound_links: BTreeMap<ServerId, Arc<Link>>,
    /// key = link.src
    inbound_links: BTreeMap<ServerId, Arc<Link>>,
    /// Per snapshot, the inbound sources whose recording window has closed.
    received_markers: HashMap<SnapshotId, HashSet<ServerId>>,
    active_snapshots: SnapshotStore,
    completed_snapshots: SnapshotStore,
}

impl Server {
    pub fn new(id: &str, tokens: u64, ctx: Arc<dyn SnapshotContext>) -> Self {
        Server {
            id: id.to_string(),
            tokens,
            ctx,
            outbound_links: BTreeMap::new(),
            inbound_links: BTreeMap::new(),
            received_markers: HashMap::new(),
            active_snapshots: SnapshotStore::new(),
            completed_snapshots: SnapshotStore::new(),
        }
    }

    /// Register a link whose source is this server.
    pub fn add_outbound(&mut self, link: Arc<Link>) {
        self.outbound_links.insert(link.dest.clone(), link);
    }

    /// Register a link whose destination is this server.
    pub fn add_inbound(&mut self, link: Arc<Link>) {
        self.inbound_links.insert(link.src.clone(), link);
    }

    /// Outbound links in destination order.
    pub fn outbound_links(&self) -> impl Iterator<Item = &Arc<Link>> {
        self.outbound_links.values()
    }

    pub fn has_completed(&self, snapshot_id: SnapshotId) -> bool {
        self.completed_snapshots.contains(snapshot_id)
    }

    /// This server's finished record for `snapshot_id`, if recording is done.
    pub fn completed_snapshot(&self, snapshot_id: SnapshotId) -> Option<SnapshotState> {
        self.completed_snapshots.get(snapshot_id)
    }

    /// Entry point for every message delivered on the inbound link from
    /// `src`. Completion of the snapshot algorithm on this server is
    /// reported through `SnapshotContext::notify_snapshot_complete`.
    pub fn handle_packet(&mut self, src: &ServerId, message: Message) {
        // Recording pass, judged against window state before this message's
        // own marker takes effect: a token arriving on a channel whose
        // window is still open is in flight with respect to that cut.
        // Markers are never recorded as payload.
        let received_markers = &self.received_markers;
        let own_id = &self.id;
        self.active_snapshots.for_each(|snapshot| {
            let window_closed = received_markers
                .get(&snapshot.id)
                .is_some_and(|seen| seen.contains(src));
            if window_closed {
                return;
            }
            if let Message::Token(token) = &message {
                snapshot.messages.push(SnapshotMessage {
                    src: src.clone(),
                    dest: own_id.clone(),
                    message: token.clone(),
                });
            }
        });

        match message {
            Message::Token(token) => {
                self.tokens += token.num_tokens;
            }
            Message::Marker(marker) => {
                let snapshot_id = marker.snapshot_id;
                // First knowledge of this snapshot: record our own state and
                // start markers flowing before closing the window for `src`.
                if !self.active_snapshots.contains(snapshot_id)
                    && !self.completed_snapshots.contains(snapshot_id)
                {
                    self.start_snapshot(snapshot_id);
                }
                let seen = self.received_markers.entry(snapshot_id).or_default();
                seen.insert(src.clone());
                let complete = seen.len() == self.inbound_links.len();
                if complete {
                    self.finish_snapshot(snapshot_id);
                }
            }
        }
    }

    /// Start the snapshot algorithm on this server: record the local
    /// balance, open a recording window on every inbound channel, and flood
    /// markers to all neighbors. The initiator calls this once per id;
    /// every other server reaches it implicitly through its first inbound
    /// marker.
    pub fn start_snapshot(&mut self, snapshot_id: SnapshotId) {
        debug!(server = %self.id, snapshot_id, tokens = self.tokens, "starting snapshot");
        let mut state = SnapshotState::new(snapshot_id);
        state.tokens.insert(self.id.clone(), self.tokens);
        // A racing inbound marker may have stored a record already.
        self.active_snapshots.insert_if_absent(snapshot_id, state);
        self.received_markers.entry(snapshot_id).or_default();
        self.send_to_neighbors(Message::Marker(MarkerMessage { snapshot_id }));
        // With no inbound links there are no markers to wait for.
        if self.inbound_links.is_empty() {
            self.finish_snapshot(snapshot_id);
        }
    }

    fn finish_snapshot(&mut self, snapshot_id: SnapshotId) {
        if let Some(state) = self.active_snapshots.remove(snapshot_id) {
            debug!(
                server = %self.id,
                snapshot_id,
                in_flight = state.messages.len(),
                "snapshot complete"
            );
            self.completed_snapshots.insert(snapshot_id, state);
            self.ctx.notify_snapshot_complete(&self.id, snapshot_id);
        }
    }

    /// Send a number of tokens to a neighbor attached to this server.
    /// Overdraft and an unknown destination are caller bugs; both leave the
    /// balance untouched.
    pub fn send_tokens(&mut self, num_tokens: u64, dest: &ServerId) -> Result<(), SimError> {
        if num_tokens > self.tokens {
            return Err(SimError::Overdraft {
                server: self.id.clone(),
                requested: num_tokens,
                held: self.tokens,
            });
        }
        let link = self
            .outbound_links
            .get(dest)
            .cloned()
            .ok_or_else(|| SimError::UnknownDestination {
                src: self.id.clone(),
                dest: dest.clone(),
            })?;
        let message = Message::Token(TokenMessage { num_tokens });
        self.ctx.record_sent(&self.id, dest, &message);
        // Update local state before the tokens hit the wire.
        self.tokens -= num_tokens;
        link.push(SendEvent {
            src: self.id.clone(),
            dest: dest.clone(),
            message,
            receive_time: self.ctx.receive_time(),
        });
        Ok(())
    }

    /// Send a message on all of the server's outbound links, in destination
    /// order so event traces are reproducible.
    pub fn send_to_neighbors(&self, message: Message) {
        for (dest, link) in &self.outbound_links {
            self.ctx.record_sent(&self.id, dest, &message);
            link.push(SendEvent {
                src: self.id.clone(),
                dest: dest.clone(),
                message: message.clone(),
                receive_time: self.ctx.receive_time(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Stub scheduler capability: constant delivery stamp, completions
    /// collected for inspection.
    #[derive(Default)]
    struct TestContext {
        completions: Mutex<Vec<(ServerId, SnapshotId)>>,
    }

    impl SnapshotContext for TestContext {
        fn receive_time(&self) -> u64 {
            1
        }

        fn notify_snapshot_complete(&self, server_id: &ServerId, snapshot_id: SnapshotId) {
            self.completions
                .lock()
                .unwrap()
                .push((server_id.clone(), snapshot_id));
        }

        fn record_sent(&self, _src: &ServerId, _dest: &ServerId, _message: &Message) {}
    }

    fn wire(src: &mut Server, dest: &mut Server) {
        let link = Arc::new(Link::new(&src.id, &dest.id));
        src.add_outbound(link.clone());
        dest.add_inbound(link);
    }

    fn completions(ctx: &Arc<TestContext>) -> Vec<(ServerId, SnapshotId)> {
        ctx.completions.lock().unwrap().clone()
    }

    #[test]
    fn overdraft_fails_and_leaves_balance_unchanged() {
        let ctx = Arc::new(TestContext::default());
        let mut server = Server::new("A", 10, ctx);

        let err = server.send_tokens(100, &"B".to_string()).unwrap_err();
        assert_eq!(
            err,
            SimError::Overdraft {
                server: "A".to_string(),
                requested: 100,
                held: 10,
            }
        );
        assert_eq!(server.tokens, 10);
    }

    #[test]
    fn unknown_destination_fails() {
        let ctx = Arc::new(TestContext::default());
        let mut server = Server::new("A", 10, ctx);

        let err = server.send_tokens(5, &"Z".to_string()).unwrap_err();
        assert_eq!(
            err,
            SimError::UnknownDestination {
                src: "A".to_string(),
                dest: "Z".to_string(),
            }
        );
        assert_eq!(server.tokens, 10);
    }

    #[test]
    fn send_tokens_debits_and_enqueues_in_order() {
        let ctx = Arc::new(TestContext::default());
        let mut a = Server::new("A", 10, ctx.clone());
        let mut b = Server::new("B", 0, ctx);
        wire(&mut a, &mut b);

        a.send_tokens(3, &"B".to_string()).unwrap();
        a.send_tokens(4, &"B".to_string()).unwrap();
        assert_eq!(a.tokens, 3);

        let link = a.outbound_links().next().unwrap().clone();
        assert_eq!(link.pop_due(1).unwrap().message.num_tokens(), 3);
        assert_eq!(link.pop_due(1).unwrap().message.num_tokens(), 4);
    }

    #[test]
    fn recorded_balance_is_taken_at_marker_send() {
        let ctx = Arc::new(TestContext::default());
        let mut a = Server::new("A", 10, ctx.clone());
        let mut b = Server::new("B", 10, ctx);
        wire(&mut a, &mut b);
        wire(&mut b, &mut a);

        a.send_tokens(5, &"B".to_string()).unwrap();
        a.start_snapshot(1);

        // Balance recorded after the send, at the instant markers went out.
        let marker = Message::Marker(MarkerMessage { snapshot_id: 1 });
        b.handle_packet(&"A".to_string(), Message::Token(TokenMessage { num_tokens: 5 }));
        b.handle_packet(&"A".to_string(), marker.clone());
        a.handle_packet(&"B".to_string(), marker);

        let recorded = a.completed_snapshot(1).unwrap();
        assert_eq!(recorded.tokens["A"], 5);
    }

    #[test]
    fn token_on_open_window_is_recorded_and_window_closes_on_marker() {
        let ctx = Arc::new(TestContext::default());
        let mut a = Server::new("A", 10, ctx.clone());
        let mut b = Server::new("B", 10, ctx.clone());
        let mut c = Server::new("C", 10, ctx.clone());
        wire(&mut a, &mut b);
        wire(&mut c, &mut b);

        b.start_snapshot(1);

        // Window for A is open: this transfer is in flight for the cut.
        b.handle_packet(&"A".to_string(), Message::Token(TokenMessage { num_tokens: 5 }));
        assert_eq!(b.tokens, 15);

        // Marker closes A's window; later tokens from A still credit the
        // balance but are no longer in flight for this snapshot.
        b.handle_packet(&"A".to_string(), Message::Marker(MarkerMessage { snapshot_id: 1 }));
        b.handle_packet(&"A".to_string(), Message::Token(TokenMessage { num_tokens: 2 }));
        assert_eq!(b.tokens, 17);

        b.handle_packet(&"C".to_string(), Message::Marker(MarkerMessage { snapshot_id: 1 }));

        let recorded = b.completed_snapshot(1).unwrap();
        assert_eq!(recorded.tokens["B"], 10);
        assert_eq!(recorded.messages.len(), 1);
        assert_eq!(recorded.messages[0].src, "A");
        assert_eq!(recorded.messages[0].message.num_tokens, 5);
        assert_eq!(completions(&ctx), vec![("B".to_string(), 1)]);
    }

    #[test]
    fn inbound_marker_starts_snapshot_implicitly() {
        let ctx = Arc::new(TestContext::default());
        let mut a = Server::new("A", 10, ctx.clone());
        let mut b = Server::new("B", 7, ctx.clone());
        let mut c = Server::new("C", 10, ctx.clone());
        wire(&mut a, &mut b);
        wire(&mut c, &mut b);

        b.handle_packet(&"A".to_string(), Message::Marker(MarkerMessage { snapshot_id: 3 }));
        // One of two inbound windows closed: still recording.
        assert!(!b.has_completed(3));
        assert!(completions(&ctx).is_empty());

        b.handle_packet(&"C".to_string(), Message::Marker(MarkerMessage { snapshot_id: 3 }));
        let recorded = b.completed_snapshot(3).unwrap();
        assert_eq!(recorded.tokens["B"], 7);
        assert!(recorded.messages.is_empty());
    }

    #[test]
    fn completion_fires_exactly_once() {
        let ctx = Arc::new(TestContext::default());
        let mut a = Server::new("A", 10, ctx.clone());
        let mut b = Server::new("B", 10, ctx.clone());
        wire(&mut a, &mut b);

        b.handle_packet(&"A".to_string(), Message::Marker(MarkerMessage { snapshot_id: 1 }));
        assert!(b.has_completed(1));

        // Duplicate marker delivery must not restart or re-notify.
        b.handle_packet(&"A".to_string(), Message::Marker(MarkerMessage { snapshot_id: 1 }));
        assert_eq!(completions(&ctx), vec![("B".to_string(), 1)]);
    }

    #[test]
    fn zero_inbound_initiator_completes_immediately() {
        let ctx = Arc::new(TestContext::default());
        let mut a = Server::new("A", 10, ctx.clone());
        let mut b = Server::new("B", 10, ctx.clone());
        wire(&mut a, &mut b);

        a.start_snapshot(1);

        assert!(a.has_completed(1));
        assert_eq!(a.completed_snapshot(1).unwrap().tokens["A"], 10);
        assert_eq!(completions(&ctx), vec![("A".to_string(), 1)]);
        // The marker still went out to B.
        let link = a.outbound_links().next().unwrap();
        assert!(!link.is_empty());
    }

    #[test]
    fn markers_broadcast_to_all_neighbors_in_dest_order() {
        let ctx = Arc::new(TestContext::default());
        let mut a = Server::new("A", 10, ctx.clone());
        let mut b = Server::new("B", 10, ctx.clone());
        let mut c = Server::new("C", 10, ctx.clone());
        wire(&mut b, &mut a);
        wire(&mut b, &mut c);

        b.send_to_neighbors(Message::Marker(MarkerMessage { snapshot_id: 1 }));

        let dests: Vec<ServerId> = b.outbound_links().map(|link| link.dest.clone()).collect();
        assert_eq!(dests, vec!["A".to_string(), "C".to_string()]);
        for link in b.outbound_links() {
            assert!(!link.is_empty());
        }
    }
}
