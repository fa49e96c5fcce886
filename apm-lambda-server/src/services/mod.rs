//! Long-running services of the extension.

pub mod lifecycle;
pub mod transport;

mod extension;
mod server;

pub use self::extension::*;
pub use self::server::*;
