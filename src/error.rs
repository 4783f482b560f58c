use thiserror::Error;

use crate::control::Activity;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio hardware unavailable: {0}")]
    EngineUnavailable(String),

    #[error("invalid rate configuration: {0}")]
    Config(String),

    #[error("frequency {freq_mhz:.1} MHz outside band {min_mhz:.1}-{max_mhz:.1} MHz")]
    FrequencyOutOfRange {
        freq_mhz: f64,
        min_mhz: f64,
        max_mhz: f64,
    },

    #[error("{consumer} failed: {reason}")]
    ConsumerFailure {
        consumer: &'static str,
        reason: String,
    },

    #[error("metadata decoder unavailable: {0}")]
    DecoderUnavailable(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("device busy: {0:?} in progress")]
    Busy(Activity),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RadioError>;

impl RadioError {
    pub fn consumer(consumer: &'static str, reason: impl std::fmt::Display) -> Self {
        RadioError::ConsumerFailure {
            consumer,
            reason: reason.to_string(),
        }
    }
}
