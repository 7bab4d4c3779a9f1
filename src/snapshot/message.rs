use crate::common::{ServerId, SnapshotId};

/// Messages exchanged between servers. Token messages move tokens from one
/// server to another; marker messages carry the progress of a snapshot and
/// demarcate, per channel, the boundary of its recording window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Token(TokenMessage),
    Marker(MarkerMessage),
}

/// Transfer of tokens from one server to another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenMessage {
    pub num_tokens: u64,
}

/// Control message demarcating the recording boundary on the channel it
/// travels, for the snapshot it names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkerMessage {
    pub snapshot_id: SnapshotId,
}

/// A token transfer caught in flight during a snapshot's recording window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotMessage {
    pub src: ServerId,
    pub dest: ServerId,
    pub message: TokenMessage,
}

impl Message {
    /// Tokens this message moves. Markers move none.
    pub fn num_tokens(&self) -> u64 {
        match self {
            Message::Token(token) => token.num_tokens,
            Message::Marker(_) => 0,
        }
    }
}
