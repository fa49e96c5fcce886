//! Configuration for the APM Lambda extension.
//!
//! The configuration is assembled in three layers: built-in defaults, an optional YAML file and
//! finally overrides from command line arguments or environment variables. See
//! [`Config::from_path`] and [`Config::apply_override`].
//!
//! ```yaml
//! server:
//!   url: https://apm.example.com/
//!   api_key: my-key
//! batch:
//!   max_size: 50
//!   max_age_ms: 2000
//! transport:
//!   send_strategy: syncflush
//! logging:
//!   level: debug
//! ```
#![warn(missing_docs)]

mod config;
mod upstream;

pub use self::config::*;
pub use self::upstream::*;
