//! Integration test infrastructure for the VPN manager
//!
//! Provides:
//! - Identifier and configuration fixtures
//! - A recording change handler
//! - Deadline-based verification helpers
//! - Coordinator scenario tests (see `tests/`)

pub mod fixtures;
mod recorder;
mod verification;

pub use fixtures::*;
pub use recorder::{Dispatch, RecordingHandler};
pub use verification::*;
