use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("no capture interface named '{0}'")]
    NoSuchInterface(String),

    #[error("capture interface '{0}' does not provide an ethernet channel")]
    UnsupportedChannel(String),

    #[error("capture read failed: {0}")]
    CaptureRead(std::io::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
