use std::collections::VecDeque;
use std::sync::Mutex;

use crate::common::ServerId;

use super::message::Message;

/// A message queued on a link, stamped with the tick the scheduler should
/// deliver it at. The stamp is opaque to the protocol core.
#[derive(Clone, Debug)]
pub struct SendEvent {
    pub src: ServerId,
    pub dest: ServerId,
    pub message: Message,
    pub receive_time: u64,
}

/// A unidirectional communication channel between two servers.
///
/// The sending server pushes events at the tail; the scheduler pops them at
/// the head, strictly in enqueue order. FIFO per link is load-bearing for the
/// snapshot algorithm: everything a server sent before its marker must arrive
/// before the marker. The link is shared (`Arc`) between its two endpoints
/// and the scheduler, so the queue synchronizes internally.
pub struct Link {
    pub src: ServerId,
    pub dest: ServerId,
    events: Mutex<VecDeque<SendEvent>>,
}

impl Link {
    pub fn new(src: &str, dest: &str) -> Self {
        Link {
            src: src.to_string(),
            dest: dest.to_string(),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an event at the tail.
    pub fn push(&self, event: SendEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    /// Pop the head event if it is due at `now`. Only the head is ever
    /// considered: a due event queued behind a not-yet-due one stays put,
    /// preserving per-link delivery order.
    pub fn pop_due(&self, now: u64) -> Option<SendEvent> {
        let mut events = self.events.lock().unwrap();
        if events.front().is_some_and(|event| event.receive_time <= now) {
            events.pop_front()
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    /// Tokens currently in transit on this link.
    pub fn pending_tokens(&self) -> u64 {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.message.num_tokens())
            .sum()
    }
}
