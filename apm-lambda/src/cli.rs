use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use apm_lambda_config::{Config, OverridableConfig};
use clap::ArgMatches;

use crate::cliapp::make_app;
use crate::setup;

/// Loads the configuration and runs the extension until it is shut down.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    config.apply_override(extract_config_args(&matches))?;

    setup::init_logging(&config);
    setup::check_config(&config)?;
    setup::dump_spawn_infos(&config);

    apm_lambda_server::run(config).context("extension failed")?;

    apm_lambda_log::info!("extension shut down");
    Ok(())
}

/// Returns the file name of the running binary.
fn binary_name() -> Option<String> {
    let exe = env::current_exe().ok()?;
    let name = Path::new(&exe).file_name()?.to_str()?;
    Some(name.to_owned())
}

/// Extract config arguments from a parsed command line arguments object.
pub fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    let get = |id: &str| matches.get_one::<String>(id).cloned();

    OverridableConfig {
        server_url: get("server_url"),
        api_key: get("api_key"),
        secret_token: get("secret_token"),
        send_strategy: get("send_strategy"),
        receiver_port: get("receiver_port"),
        receiver_timeout: get("receiver_timeout"),
        forwarder_timeout: get("forwarder_timeout"),
        logs_enabled: get("logs_enabled"),
        function_logs: get("function_logs"),
        log_level: get("log_level"),
        log_format: get("log_format"),
        batch_max_size: get("batch_max_size"),
        batch_max_age_ms: get("batch_max_age_ms"),
        runtime_api: get("runtime_api"),
        extension_name: get("extension_name").or_else(binary_name),
    }
}
