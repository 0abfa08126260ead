//! Engine error types
//!
//! Every failure the engine can report collapses onto one of four
//! [`ErrorKind`]s. Those kinds are what travels through
//! [`Notification::Error`](crate::Notification::Error); the richer
//! [`EngineError`] is what synchronous calls return.

use std::path::PathBuf;

use thiserror::Error;

use crate::audio::TrackError;
use crate::session::SessionState;

/// Coarse error category delivered to `onError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad channel/slot/index values, or a command issued in the wrong state
    InvalidConfiguration,
    /// A track file could not be opened or decoded
    DecodeFailure,
    /// Writing or promoting a recording failed
    IoFailure,
    /// The audio device could not be opened or was lost
    DeviceFailure,
}

impl ErrorKind {
    /// Stable integer code for hosts that expect `onError(int)`
    pub fn code(self) -> i32 {
        match self {
            Self::InvalidConfiguration => 0,
            Self::DecodeFailure => 1,
            Self::IoFailure => 2,
            Self::DeviceFailure => 3,
        }
    }

    /// Whether the session can continue after this error.
    ///
    /// A device failure requires `reset` or `release`.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::DeviceFailure)
    }
}

/// Errors returned by [`SessionEngine`](crate::SessionEngine) commands
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Cannot {op} while {state:?}")]
    InvalidState { op: &'static str, state: SessionState },

    #[error("Failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: TrackError,
    },

    #[error("Recording failed: {0}")]
    Recording(#[source] TrackError),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Command queue is full")]
    CommandQueueFull,

    #[error("Engine has been released")]
    Released,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration(_) | Self::InvalidState { .. } | Self::Released => {
                ErrorKind::InvalidConfiguration
            }
            Self::Decode { .. } => ErrorKind::DecodeFailure,
            Self::Recording(_) => ErrorKind::IoFailure,
            // A full queue means the audio callback stopped draining it
            Self::Device(_) | Self::CommandQueueFull => ErrorKind::DeviceFailure,
        }
    }
}
