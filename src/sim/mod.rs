pub mod logger;
pub mod simulator;

pub use logger::*;
pub use simulator::*;
