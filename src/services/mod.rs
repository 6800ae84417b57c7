pub mod backoff;
pub mod store;
pub mod telegram;

pub use store::*;
pub use telegram::*;
