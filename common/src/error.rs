use thiserror::Error;

pub type Result<T> = std::result::Result<T, HeatingError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HeatingError {
    #[error("unknown zone: {0}")]
    UnknownZone(String),

    #[error("unknown device {device} in zone {zone}")]
    UnknownDevice { zone: String, device: String },

    #[error("unknown schedule {schedule} in zone {zone}")]
    UnknownSchedule { zone: String, schedule: String },

    #[error("invalid value: {0}")]
    Validation(String),

    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("actuation of {device} failed: {message}")]
    Actuation { device: String, message: String },

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl HeatingError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn actuation(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Actuation {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Unknown zone, device or schedule id.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownZone(_) | Self::UnknownDevice { .. } | Self::UnknownSchedule { .. }
        )
    }
}
