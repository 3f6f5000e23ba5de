pub mod data;
pub mod fetch;

pub use data::{Nip11Fees, Nip11Info, Nip11Limitation, Nip11RetentionEntry, RetentionKinds};
pub use fetch::{NIP11_MAX_BODY_SIZE, Nip11Document, fetch_nip11};
