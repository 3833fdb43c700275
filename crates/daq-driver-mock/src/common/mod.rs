//! Common infrastructure for mock acquisition objects.
//!
//! - **errors**: error and delay injection
//! - **rng**: seeded random number generator
//! - **calls**: per-object capability call counters

pub mod calls;
pub mod errors;
pub mod rng;

pub use calls::{CallCounts, CallSnapshot};
pub use errors::{ErrorConfig, ErrorScenario, MockFault};
pub use rng::MockRng;
