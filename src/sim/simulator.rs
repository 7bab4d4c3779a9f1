use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::common::{ServerId, SimError, SnapshotId};
use crate::snapshot::{Link, Message, Server, SnapshotContext, SnapshotState};

use super::logger::{EventLog, LoggedEvent};

/// Upper bound on the random extra delivery delay, in ticks.
const MAX_DELAY: u64 = 5;

/// Tick budget for draining one snapshot before declaring it stalled.
const MAX_COLLECT_TICKS: u64 = 10_000;

/// Shared scheduler state handed to every server as its
/// [`SnapshotContext`]: the tick clock, the seeded jitter source, the event
/// trace, and the completion-notification channel.
pub struct SimHandle {
    time: AtomicU64,
    rng: Mutex<StdRng>,
    log: EventLog,
    completed_tx: UnboundedSender<(ServerId, SnapshotId)>,
}

impl SimHandle {
    fn advance_time(&self) -> u64 {
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn now(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }
}

impl SnapshotContext for SimHandle {
    fn receive_time(&self) -> u64 {
        let jitter = self.rng.lock().unwrap().gen_range(0..MAX_DELAY);
        self.now() + 1 + jitter
    }

    fn notify_snapshot_complete(&self, server_id: &ServerId, snapshot_id: SnapshotId) {
        debug!(server = %server_id, snapshot_id, "local snapshot finished");
        // The receiver is gone when servers are driven standalone in tests.
        let _ = self.completed_tx.send((server_id.clone(), snapshot_id));
    }

    fn record_sent(&self, src: &ServerId, dest: &ServerId, message: &Message) {
        self.log.record(
            self.now(),
            LoggedEvent::Sent {
                src: src.clone(),
                dest: dest.clone(),
                message: message.clone(),
            },
        );
    }
}

/// Discrete-event scheduler driving a set of passive servers.
///
/// Delivery respects FIFO order per link; delivery times carry seeded random
/// jitter, so a given seed replays the exact same execution. The simulator
/// is also the collection point for finished snapshots: servers report
/// completion over the channel in [`SimHandle`], and
/// [`Simulator::collect_snapshot`] stitches their local records into the
/// global cut.
pub struct Simulator {
    handle: Arc<SimHandle>,
    servers: BTreeMap<ServerId, Server>,
    completed_rx: UnboundedReceiver<(ServerId, SnapshotId)>,
    next_snapshot_id: SnapshotId,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SimHandle {
            time: AtomicU64::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            log: EventLog::new(),
            completed_tx,
        });
        Simulator {
            handle,
            servers: BTreeMap::new(),
            completed_rx,
            next_snapshot_id: 0,
        }
    }

    pub fn add_server(&mut self, id: &str, tokens: u64) {
        let ctx: Arc<dyn SnapshotContext> = self.handle.clone();
        let server = Server::new(id, tokens, ctx);
        self.servers.insert(id.to_string(), server);
    }

    /// Wire a unidirectional link from `src` to `dest`. Self-links are
    /// ignored.
    pub fn add_forward_link(&mut self, src: &str, dest: &str) -> Result<(), SimError> {
        if src == dest {
            return Ok(());
        }
        if !self.servers.contains_key(dest) {
            return Err(SimError::UnknownServer(dest.to_string()));
        }
        let link = Arc::new(Link::new(src, dest));
        self.servers
            .get_mut(src)
            .ok_or_else(|| SimError::UnknownServer(src.to_string()))?
            .add_outbound(link.clone());
        self.servers
            .get_mut(dest)
            .ok_or_else(|| SimError::UnknownServer(dest.to_string()))?
            .add_inbound(link);
        Ok(())
    }

    /// Inject a token transfer from `src` to `dest`.
    pub fn send_tokens(&mut self, src: &str, num_tokens: u64, dest: &str) -> Result<(), SimError> {
        let dest_id = dest.to_string();
        self.servers
            .get_mut(src)
            .ok_or_else(|| SimError::UnknownServer(src.to_string()))?
            .send_tokens(num_tokens, &dest_id)
    }

    /// Advance the clock one step and deliver at most one due event per
    /// source server, scanning servers and their outbound links in id order
    /// so executions replay identically.
    pub fn tick(&mut self) {
        let now = self.handle.advance_time();
        let server_ids: Vec<ServerId> = self.servers.keys().cloned().collect();
        for server_id in server_ids {
            let links: Vec<Arc<Link>> = self.servers[&server_id].outbound_links().cloned().collect();
            for link in links {
                if let Some(event) = link.pop_due(now) {
                    self.handle.log.record(
                        now,
                        LoggedEvent::Received {
                            src: event.src.clone(),
                            dest: event.dest.clone(),
                            message: event.message.clone(),
                        },
                    );
                    if let Some(dest) = self.servers.get_mut(&event.dest) {
                        dest.handle_packet(&event.src, event.message);
                    }
                    break;
                }
            }
        }
    }

    pub fn time(&self) -> u64 {
        self.handle.now()
    }

    /// Kick off a snapshot at `server_id`, returning the id assigned to it.
    pub fn start_snapshot(&mut self, server_id: &str) -> Result<SnapshotId, SimError> {
        let snapshot_id = self.next_snapshot_id;
        self.next_snapshot_id += 1;
        info!(server = %server_id, snapshot_id, "initiating snapshot");
        self.servers
            .get_mut(server_id)
            .ok_or_else(|| SimError::UnknownServer(server_id.to_string()))?
            .start_snapshot(snapshot_id);
        Ok(snapshot_id)
    }

    /// Drive the simulation until every server has finished recording
    /// `snapshot_id`, then merge the per-server records into the global cut.
    /// Topologies where markers cannot reach every server stall and report
    /// an error once the tick budget runs out.
    pub fn collect_snapshot(&mut self, snapshot_id: SnapshotId) -> Result<SnapshotState, SimError> {
        let mut pending: HashSet<ServerId> = self.servers.keys().cloned().collect();
        let deadline = self.time() + MAX_COLLECT_TICKS;
        loop {
            while let Ok((server_id, id)) = self.completed_rx.try_recv() {
                if id == snapshot_id {
                    pending.remove(&server_id);
                }
            }
            if pending.is_empty() {
                break;
            }
            if self.time() >= deadline {
                return Err(SimError::SnapshotStalled { snapshot_id });
            }
            self.tick();
        }

        let mut global = SnapshotState::new(snapshot_id);
        for server in self.servers.values() {
            let local = server
                .completed_snapshot(snapshot_id)
                .ok_or(SimError::SnapshotStalled { snapshot_id })?;
            global.merge(&local);
        }
        info!(
            snapshot_id,
            servers = global.tokens.len(),
            in_flight = global.messages.len(),
            total = global.total_tokens(),
            "collected global snapshot"
        );
        Ok(global)
    }

    /// Sum of all balances plus everything still queued on links. Constant
    /// for the lifetime of a run: tokens are conserved.
    pub fn total_tokens(&self) -> u64 {
        self.servers
            .values()
            .map(|server| {
                let queued: u64 = server.outbound_links().map(|link| link.pending_tokens()).sum();
                server.tokens + queued
            })
            .sum()
    }

    pub fn server(&self, id: &str) -> Option<&Server> {
        self.servers.get(id)
    }

    pub fn events(&self) -> Vec<(u64, LoggedEvent)> {
        self.handle.log.events()
    }
}
