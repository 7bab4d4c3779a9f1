//! Chandy-Lamport distributed snapshots over a simulated server network.
//!
//! Servers exchange token messages over directed FIFO links while any server
//! may initiate a global snapshot. The recorded cut (every balance plus every
//! in-flight transfer) is consistent even though no server or channel pauses.
//! The `snapshot` module holds the protocol; `sim` holds the discrete-event
//! scheduler that drives it.

pub mod common;
pub mod sim;
pub mod snapshot;
