//! Per-invocation accumulation of agent and platform telemetry.

mod batch;
mod invocation;
mod payload;

pub use self::batch::*;
pub use self::invocation::*;
pub use self::payload::*;
