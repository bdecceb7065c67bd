use thiserror::Error;

/// Failures of a capture request. A request that ends in one of these is not
/// retried, the user has to start a new capture.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandoffError {
    #[error("host surface not found")]
    NoHostSurface,

    #[error("capture surface failed to load: {0}")]
    SurfaceLoad(String),

    #[error("no capture source with a name is available")]
    NoCaptureSource,

    #[error("capture source id was never delivered")]
    SourceUnavailable,
}

pub type Result<T> = std::result::Result<T, HandoffError>;
