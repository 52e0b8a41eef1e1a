use pathprobe_observer::ObserverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("applying host configuration failed: {0}")]
    Configuration(String),

    #[error("flow meter exited with error {0}")]
    MeterExit(i32),

    #[error("flow meter terminated by signal {0}")]
    MeterSignal(i32),

    #[error("meter configuration: {0}")]
    MeterConfig(#[from] serde_yaml::Error),

    #[error("flow ingress listener failed: {0}")]
    Ingress(std::io::Error),

    #[error("capture error: {0}")]
    Capture(#[from] ObserverError),

    #[error("malformed job file '{0}': {1}")]
    JobFile(String, String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
