use std::sync::Mutex;

use tracing::trace;

use crate::common::ServerId;
use crate::snapshot::Message;

/// One entry in the simulation trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoggedEvent {
    Sent {
        src: ServerId,
        dest: ServerId,
        message: Message,
    },
    Received {
        src: ServerId,
        dest: ServerId,
        message: Message,
    },
}

/// Append-only trace of everything that moved through the simulation,
/// stamped with the tick it happened on. Servers report sends through their
/// scheduler context; the scheduler records receptions itself at delivery.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<(u64, LoggedEvent)>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, time: u64, event: LoggedEvent) {
        trace!(time, ?event, "trace event");
        self.events.lock().unwrap().push((time, event));
    }

    pub fn events(&self) -> Vec<(u64, LoggedEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}
