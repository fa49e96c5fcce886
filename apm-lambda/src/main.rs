//! The APM Lambda extension binary.
//!
//! Lambda starts every executable in `/opt/extensions` next to the function. This binary
//! registers with the runtime, receives the telemetry of the function's APM agent on a local
//! intake and forwards it to the configured backend.
//!
//! # Configuration
//!
//! The extension is configured through environment variables set on the function. An optional
//! YAML file can be given with `--config`; environment variables and command line flags take
//! precedence over it. Run the binary with `--help` for the full list.

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            apm_lambda_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
