use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum CoordinatorError {
    #[error("Radio tool not available: {0}")]
    RadioToolMissing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
