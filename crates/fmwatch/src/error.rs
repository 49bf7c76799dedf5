//! Engine errors

use std::io;

use thiserror::Error;

use crate::pipeline::Stage;

/// Error from the monitoring engine
///
/// Only configuration and startup errors ever reach the
/// caller of [`Monitor::start()`](crate::Monitor::start).
/// Failures inside the background workers are logged and
/// the workers carry on.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// A configuration value is out of range
    #[error("invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    /// The configuration file is not valid TOML
    #[error("unable to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A pipeline stage could not be spawned
    #[error("unable to spawn {stage} stage: {source}")]
    Spawn {
        stage: Stage,
        #[source]
        source: io::Error,
    },

    /// A spawned stage did not provide the requested pipe
    #[error("{stage} stage has no {pipe} pipe")]
    MissingPipe { stage: Stage, pipe: &'static str },

    /// The metadata feed has not been created yet
    #[error("metadata feed is not available")]
    FeedUnavailable,

    /// `start()` was called on a running engine
    #[error("monitor is already running")]
    AlreadyRunning,

    /// Any other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MonitorError {
    pub(crate) fn invalid<K, M>(key: K, message: M) -> Self
    where
        K: Into<String>,
        M: Into<String>,
    {
        MonitorError::InvalidConfig {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, MonitorError>;
