/// Value of the `Server` header on responses of the local intake.
pub const SERVER: &str = concat!("apm-lambda-extension/", env!("CARGO_PKG_VERSION"));

/// User agent of all requests to the backend.
pub const USER_AGENT: &str = concat!("apm-lambda-extension/", env!("CARGO_PKG_VERSION"));

/// Path of the event intake, both locally and on the backend.
pub const INTAKE_PATH: &str = "intake/v2/events";

/// Content type of NDJSON payloads sent to the backend.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Content type the agent uses to register a transaction.
pub const TRANSACTION_CONTENT_TYPE: &str = "application/vnd.elastic.apm.transaction+ndjson";

/// Header carrying the Lambda request id on transaction registrations.
pub const REQUEST_ID_HEADER: &str = "x-elastic-aws-request-id";

/// Maximum size of backend response bodies that are read for diagnostics.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024;
