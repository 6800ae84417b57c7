pub mod delivery;
pub mod outbox_api;

pub use delivery::*;
