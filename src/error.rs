//! Error taxonomy for the ingestion engine.
//!
//! Categories mirror the failure modes a field deployment actually hits:
//! bad configuration (fatal at startup), transient connection loss
//! (retried by the driver/sink itself), malformed wire data, a full
//! downstream queue, and storage/query failures. Only `ConfigError` is
//! ever fatal; everything else is logged and the caller continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("sink {sink} refers to unconfigured device {device}")]
    UnresolvedPullFromDevice { sink: String, device: String },
    #[error("duplicate device name: {0}")]
    DuplicateDeviceName(String),
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("unable to reach {target}: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {0} closed by peer")]
    Closed(String),
    #[error("handshake with {0} failed: {1}")]
    HandshakeFailed(String, String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("CRC mismatch in frame from {0}")]
    CrcMismatch(String),
    #[error("malformed frame from {station}: {reason}")]
    MalformedFrame { station: String, reason: String },
    #[error("unparseable timestamp: {0}")]
    UnparseableTimestamp(String),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("queue full for sink {0}, reading dropped")]
    QueueFull(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("insert failed: {0}")]
    InsertFailed(#[source] sqlx::Error),
    #[error("query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),
    #[error("database unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("station name '{0}' is not configured")]
    UnknownStation(String),
    #[error("no weather readings found for station {0}")]
    NoReadingsFound(String),
}

impl From<ValidationError> for tonic::Status {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::UnknownStation(_) => tonic::Status::invalid_argument(e.to_string()),
            ValidationError::NoReadingsFound(_) => {
                tonic::Status::failed_precondition(e.to_string())
            }
        }
    }
}

impl From<StorageError> for tonic::Status {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable => tonic::Status::unavailable("database unavailable"),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
