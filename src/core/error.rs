use thiserror::Error;

/// Error taxonomy for the firewall engine.
///
/// Mutation paths always surface these; best-effort read probes (ping status,
/// version in base-info) degrade to sentinel values instead.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("no supported firewall backend installed (firewalld or ufw required)")]
    NoBackendAvailable,

    #[error("illegal token in command parameter: {token}")]
    IllegalToken { token: String },

    #[error("{operation}: command `{command}` failed with code {code}: {stderr} {stdout}")]
    CommandFailed {
        operation: String,
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("{operation}: command `{command}` timed out after {timeout_ms}ms")]
    CommandTimeout {
        operation: String,
        command: String,
        timeout_ms: u64,
    },

    #[error("unparsable output from `{command}`: {detail}")]
    UnexpectedOutput { command: String, detail: String },

    #[error("invalid port value: {port}")]
    InvalidPort { port: String },

    #[error("invalid protocol value: {protocol}")]
    InvalidProtocol { protocol: String },

    #[error("invalid strategy value: {strategy}")]
    InvalidStrategy { strategy: String },

    #[error("duplicate forward target {port} -> {target_ip}:{target_port} in request")]
    DuplicateForward {
        port: String,
        target_ip: String,
        target_port: String,
    },

    #[error("batch partially applied ({applied}/{total} atomic calls): {source}")]
    PartialBatch {
        applied: usize,
        total: usize,
        #[source]
        source: Box<FirewallError>,
    },

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("sysctl config error: {0}")]
    SysConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FirewallError {
    /// Stable dotted error code for API consumers and logs.
    pub fn to_error_code(&self) -> &'static str {
        match self {
            Self::NoBackendAvailable => "firewall.no_backend_available",
            Self::IllegalToken { .. } => "firewall.illegal_token",
            Self::CommandFailed { .. } => "firewall.command_failed",
            Self::CommandTimeout { .. } => "firewall.command_timeout",
            Self::UnexpectedOutput { .. } => "firewall.unexpected_output",
            Self::InvalidPort { .. } => "firewall.invalid_port",
            Self::InvalidProtocol { .. } => "firewall.invalid_protocol",
            Self::InvalidStrategy { .. } => "firewall.invalid_strategy",
            Self::DuplicateForward { .. } => "firewall.duplicate_forward",
            Self::PartialBatch { .. } => "firewall.partial_batch",
            Self::Store(_) => "firewall.store_error",
            Self::SysConfig(_) => "firewall.sysconfig_error",
            Self::Internal(_) => "firewall.internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, FirewallError>;
