pub mod bundle;
pub mod check;
pub mod common;
pub mod conflicts;
pub mod queue;
pub mod status;
pub mod sync;
