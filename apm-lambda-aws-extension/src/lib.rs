//! Clients and models for the AWS Lambda runtime interfaces used by the extension.
//!
//! - [`ExtensionClient`] registers the extension and long-polls lifecycle events from the
//!   [Extensions API].
//! - [`LogsApiClient`] subscribes a local listener to the [Logs API].
//! - [`LogEvent`] models the events pushed to that listener.
//!
//! [Extensions API]: https://docs.aws.amazon.com/lambda/latest/dg/runtimes-extensions-api.html
//! [Logs API]: https://docs.aws.amazon.com/lambda/latest/dg/runtimes-logs-api.html
#![warn(missing_docs)]

mod event;
mod extension;
mod logs;

pub use self::event::*;
pub use self::extension::*;
pub use self::logs::*;
