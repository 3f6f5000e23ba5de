pub mod logs;
pub mod nip11;
pub mod nip66;
pub mod parsing;

pub use logs::ProbeLogs;
