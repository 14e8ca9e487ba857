//! Document models persisted by the workflow store.

pub mod instance;
pub mod payload;

pub use instance::*;
pub use payload::*;
