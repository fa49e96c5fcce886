//! Foundational concurrency primitives for the APM Lambda extension.
//!
//! - [`Latch`] is a resettable single-shot notification used to signal that the agent has sent
//!   everything it had for the current invocation.
//! - [`Controller`] owns the process-wide shutdown token and translates OS signals into a
//!   cooperative shutdown.
#![warn(missing_docs)]

mod controller;
mod latch;

pub use self::controller::*;
pub use self::latch::*;
