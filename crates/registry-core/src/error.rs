//! Error types for the editor registry.
//!
//! Every failure a registry operation can report maps onto a JSON-RPC error
//! code, so the same enum is used by the store, the dispatch service and the
//! client that decodes responses.

use thiserror::Error;

/// Main error type for the editor registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    // Registry state errors
    #[error("Instance already exists: {identifier}")]
    DuplicateInstance { identifier: String },

    #[error("Instance not found: {identifier}")]
    NotFound { identifier: String },

    #[error("Reservation pending for {identifier}, retry later")]
    ReservationPending { identifier: String },

    #[error("Reservation token invalid or expired for {identifier}")]
    ReservationInvalid { identifier: String },

    #[error("Liveness check failed for {address}: {message}")]
    LivenessFailure { address: String, message: String },

    // Protocol errors
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("IPC frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Registry daemon unreachable at {addr}")]
    DaemonUnreachable { addr: String },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// An error response decoded by the client whose code is not one of ours.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// JSON-RPC error codes used on the wire.
///
/// Standard codes sit in -32700..-32600; application codes in -32000..-32099.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    pub const INTERNAL_ERROR: i32 = -32000;
    pub const DUPLICATE_INSTANCE: i32 = -32001;
    pub const INSTANCE_NOT_FOUND: i32 = -32002;
    pub const LIVENESS_FAILURE: i32 = -32003;
    pub const RESERVATION_PENDING: i32 = -32004;
    pub const RESERVATION_INVALID: i32 = -32005;
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RegistryError {
    /// Convert to a JSON-RPC error code.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RegistryError::DuplicateInstance { .. } => codes::DUPLICATE_INSTANCE,
            RegistryError::NotFound { .. } => codes::INSTANCE_NOT_FOUND,
            RegistryError::LivenessFailure { .. } => codes::LIVENESS_FAILURE,
            RegistryError::ReservationPending { .. } => codes::RESERVATION_PENDING,
            RegistryError::ReservationInvalid { .. } => codes::RESERVATION_INVALID,

            RegistryError::Parse { .. } | RegistryError::FrameTooLarge { .. } => {
                codes::PARSE_ERROR
            }
            RegistryError::InvalidRequest { .. } => codes::INVALID_REQUEST,
            RegistryError::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            RegistryError::InvalidParams { .. } => codes::INVALID_PARAMS,

            RegistryError::Remote { code, .. } => *code,

            // All other errors are internal errors
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Rebuild an error from a JSON-RPC error object received by a client.
    ///
    /// The identifier is not carried in the error payload, so the caller
    /// supplies the one it asked about.
    pub fn from_rpc(code: i32, message: String, identifier: &str) -> Self {
        let identifier = identifier.to_string();
        match code {
            codes::DUPLICATE_INSTANCE => RegistryError::DuplicateInstance { identifier },
            codes::INSTANCE_NOT_FOUND => RegistryError::NotFound { identifier },
            codes::RESERVATION_PENDING => RegistryError::ReservationPending { identifier },
            codes::RESERVATION_INVALID => RegistryError::ReservationInvalid { identifier },
            _ => RegistryError::Remote { code, message },
        }
    }

    /// Whether the caller should poll and retry rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::ReservationPending { .. })
    }

    /// Whether this is a protocol-level decode failure.
    pub fn is_malformed_request(&self) -> bool {
        matches!(
            self,
            RegistryError::Parse { .. }
                | RegistryError::InvalidRequest { .. }
                | RegistryError::MethodNotFound { .. }
                | RegistryError::InvalidParams { .. }
                | RegistryError::FrameTooLarge { .. }
        )
    }
}
