use thiserror::Error;

/// Errors surfaced by topology discovery, event compilation, resource
/// allocation and the runtime loop.
#[derive(Debug, Error)]
pub enum CmnError {
    #[error("no CMN device matching {0:?} is present")]
    DeviceNotPresent(String),

    #[error("multiple CMN devices match {0:?}: {1:?}")]
    AmbiguousDevice(String, Vec<String>),

    #[error("failed to map device {0:?}: {1}")]
    MapError(String, std::io::Error),

    #[error("parse error at {token:?}: {reason}")]
    ParseError { token: String, reason: String },

    #[error("no free {0} available")]
    NoResources(&'static str),

    #[error("unsupported topology: {0}")]
    UnsupportedTopology(String),

    #[error("timed out waiting for DTC snapshot after {0:?}")]
    SnapshotTimeout(std::time::Duration),

    #[error("hardware assertion failed: {0}")]
    HardwareAssertion(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CmnError>;
