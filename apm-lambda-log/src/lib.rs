//! Logging facade for the APM Lambda extension.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it can be obtained from configuration files.
//!
//! ```
//! # #[cfg(feature = "init")] {
//! use apm_lambda_log::LogConfig;
//!
//! let log_config = LogConfig {
//!     enable_backtraces: true,
//!     ..LogConfig::default()
//! };
//!
//! apm_lambda_log::init(&log_config);
//! # }
//! ```
//!
//! # Logging
//!
//! Use the five logging macros: [`error!`], [`warn!`], [`info!`], [`debug!`] and [`trace!`], where
//! `error!` represents the highest-priority log messages and `trace!` the lowest.
//!
//! ## Conventions
//!
//! Log messages should start lowercase and end without punctuation. Prefer short and precise log
//! messages over verbose text. Choose the log level according to these rules:
//!
//! - [`error!`] for bugs and invalid behavior.
//! - [`warn!`] for undesirable behavior, such as dropped telemetry.
//! - [`info!`] for messages relevant to the average user.
//! - [`debug!`] for messages usually relevant to debugging.
//! - [`trace!`] for full auxiliary information.
//!
//! The extension runs next to the user's function. Nothing logged here may ever be the reason the
//! function fails, so errors are reported and swallowed by the caller.
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] that should be called
//! at the beginning of the test method. It enables test mode of the logger and customizes log
//! levels for the current crate.
//!
//! ```ignore
//! #[test]
//! fn test_something() {
//!     apm_lambda_log::init_test!();
//! }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{Level, debug, error, info, trace, warn};
