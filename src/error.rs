use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Controller session expired")]
    SessionExpired,

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Required configuration missing: {0}")]
    StartupConfigMissing(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
