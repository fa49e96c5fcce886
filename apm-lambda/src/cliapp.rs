//! This module implements the definition of the command line app.

use clap::{Arg, ArgAction, Command};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "AWS Lambda extension that forwards APM agent data to the backend.";

fn value(id: &'static str, long: &'static str, env: &'static str) -> Arg {
    Arg::new(id)
        .long(long)
        .env(env)
        .action(ArgAction::Set)
}

pub fn make_app() -> Command {
    Command::new("apm-lambda-extension")
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .after_help(
            "The extension is started by the Lambda runtime. It registers for \
             invocation and shutdown events and runs until the execution \
             environment is shut down.",
        )
        .arg(
            value("config", "config", "APM_LAMBDA_CONFIG")
                .short('c')
                .help("Path to a YAML config file."),
        )
        .arg(
            value("server_url", "server-url", "APM_LAMBDA_SERVER_URL")
                .help("The base URL of the APM backend."),
        )
        .arg(
            value("api_key", "api-key", "APM_LAMBDA_API_KEY")
                .hide_env_values(true)
                .help("API key for the backend, preferred over the secret token."),
        )
        .arg(
            value("secret_token", "secret-token", "APM_LAMBDA_SECRET_TOKEN")
                .hide_env_values(true)
                .help("Secret token for the backend."),
        )
        .arg(
            value("send_strategy", "send-strategy", "APM_LAMBDA_SEND_STRATEGY")
                .value_parser(["background", "syncflush"])
                .help("When to send data: during the next invocation or before each one ends."),
        )
        .arg(
            value("receiver_port", "receiver-port", "APM_LAMBDA_DATA_RECEIVER_PORT")
                .help("The local port the agent sends data to."),
        )
        .arg(
            value(
                "receiver_timeout",
                "receiver-timeout",
                "APM_LAMBDA_DATA_RECEIVER_TIMEOUT_SECONDS",
            )
            .help("Read timeout of agent requests in seconds."),
        )
        .arg(
            value(
                "forwarder_timeout",
                "forwarder-timeout",
                "APM_LAMBDA_DATA_FORWARDER_TIMEOUT_SECONDS",
            )
            .help("Timeout of requests to the backend in seconds."),
        )
        .arg(
            value(
                "logs_enabled",
                "logs-enabled",
                "APM_LAMBDA_ENABLE_LAMBDA_LOGS_COLLECTION",
            )
            .help("Whether platform logs are collected to correlate invocations."),
        )
        .arg(
            value(
                "function_logs",
                "function-logs",
                "APM_LAMBDA_ENABLE_FUNCTION_LOGS_COLLECTION",
            )
            .help("Whether lines written by the function are forwarded."),
        )
        .arg(
            value("log_level", "log-level", "APM_LAMBDA_LOG_LEVEL")
                .help("The log level of the extension."),
        )
        .arg(
            value("log_format", "log-format", "APM_LAMBDA_LOG_FORMAT")
                .help("The log format: auto, pretty, simplified or json."),
        )
        .arg(
            value("batch_max_size", "batch-max-size", "APM_LAMBDA_BATCH_MAX_SIZE")
                .help("Maximum number of lines sent in one request."),
        )
        .arg(
            value("batch_max_age_ms", "batch-max-age", "APM_LAMBDA_BATCH_MAX_AGE_MS")
                .help("Maximum age of buffered lines in milliseconds."),
        )
        .arg(
            value("runtime_api", "runtime-api", "AWS_LAMBDA_RUNTIME_API")
                .help("Host and port of the Lambda runtime API."),
        )
        .arg(
            value("extension_name", "extension-name", "APM_LAMBDA_EXTENSION_NAME")
                .help("The name to register with. Defaults to the file name of the binary."),
        )
}
