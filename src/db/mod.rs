pub mod pool;
pub mod store;

pub use pool::Pool;
pub use store::{InsertOutcome, Store};
