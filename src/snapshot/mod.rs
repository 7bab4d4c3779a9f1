pub mod context;
pub mod link;
pub mod message;
pub mod server;
pub mod state;

pub use context::*;
pub use link::*;
pub use message::*;
pub use server::*;
pub use state::*;
