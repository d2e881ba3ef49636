pub mod batch;
pub mod sweeper;

pub use batch::{BatchCompleter, BatchOutcome};
pub use sweeper::Sweeper;
