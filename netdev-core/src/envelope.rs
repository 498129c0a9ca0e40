//! Response envelope returned by [`NetworkCore::dispatch`](crate::NetworkCore::dispatch).
//!
//! ```json
//! {"status": "success", "data": {...}, "metadata": {...}}
//! {"status": "error", "error": {"code": "...", "message": "...", "details": {...}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Uniform result of a dispatched operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Envelope {
    Success { data: Value, metadata: Metadata },
    Error { error: ErrorBody },
}

/// Context attached to a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub device_id: String,
    pub operation: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// One of the documented `NETWORK_*` codes or `INVALID_REQUEST`.
    pub code: String,
    pub message: String,
    pub details: ErrorDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Finer-grained kind such as `PoolExhausted` or `CommandTimeout`.
    pub kind: String,
    pub retryable: bool,
    pub device_id: String,
    pub operation: String,
    /// Raw device output for command and configuration failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_output: Option<String>,
}

impl Envelope {
    pub fn success(data: Value, metadata: Metadata) -> Self {
        Envelope::Success { data, metadata }
    }

    pub fn error(err: &Error, device_id: &str, operation: &str) -> Self {
        Envelope::Error {
            error: ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
                details: ErrorDetails {
                    kind: err.kind().to_string(),
                    retryable: err.is_retryable(),
                    device_id: device_id.to_string(),
                    operation: operation.to_string(),
                    device_output: err.device_output().map(str::to_string),
                },
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Envelope::Success { data, .. } => Some(data),
            Envelope::Error { .. } => None,
        }
    }

    pub fn error_body(&self) -> Option<&ErrorBody> {
        match self {
            Envelope::Error { error } => Some(error),
            Envelope::Success { .. } => None,
        }
    }
}
