//! overdub - multi-track overdub recording engine
//!
//! Plays up to [`MAX_PLAYER_SLOTS`] prepared tracks in sample-accurate sync
//! while recording the input at the same transport position, then writes the
//! take as a 16-bit WAV file. Layering recordings over one another (beat, then
//! a voice over the beat, then a second voice over both) builds a song.
//!
//! The host drives a [`SessionEngine`] from one control thread and receives
//! [`Notification`]s back on it. The real-time half, [`audio::AudioProcessor`],
//! runs inside the audio callback and talks to the engine only through
//! lock-free queues.

pub mod audio;
mod config;
mod error;
mod session;

pub use audio::{AudioProcessor, Track, TrackError};
pub use config::{EngineConfig, MasterSource, SessionConfig, MAX_BUFFER_SIZE, MAX_PLAYER_SLOTS};
pub use error::{EngineError, ErrorKind};
pub use session::{EngineListener, Notification, RecordingJob, SessionEngine, SessionState};
