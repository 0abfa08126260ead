//! Engine and session configuration
//!
//! [`EngineConfig`] is fixed for the lifetime of an engine and is supplied by
//! the host (device sample rate, buffer size, low-latency capability). It can
//! be persisted as JSON in the platform config directory so a CLI host can
//! remember what the device reported last time.
//!
//! [`SessionConfig`] is replaced wholesale by every `init` call.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Largest callback size the real-time buffers are preallocated for
pub const MAX_BUFFER_SIZE: u32 = 8192;

/// Player slots a single session may declare
pub const MAX_PLAYER_SLOTS: usize = 5;

/// Returns the path to the config file: `~/.config/overdub/engine.json`
fn config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("overdub");
    path.push("engine.json");
    path
}

/// Device-level configuration.
///
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Device sample rate in Hz
    pub sample_rate: u32,
    /// Frames per audio callback (one tick)
    pub buffer_size: u32,
    /// Device channel count, 1 or 2
    pub channel_count: u16,
    /// Request a fixed device buffer of `buffer_size` frames
    pub low_latency: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 512,
            channel_count: 2,
            low_latency: false,
        }
    }
}

impl EngineConfig {
    pub fn new(sample_rate: u32, buffer_size: u32) -> Self {
        Self {
            sample_rate,
            buffer_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sample_rate == 0 {
            return Err(EngineError::InvalidConfiguration(
                "sample rate must be positive".to_string(),
            ));
        }
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(EngineError::InvalidConfiguration(format!(
                "buffer size {} outside 1..={}",
                self.buffer_size, MAX_BUFFER_SIZE
            )));
        }
        validate_channels(self.channel_count)
    }

    /// Frames per tick as a buffer length
    pub fn frames_per_tick(&self) -> usize {
        self.buffer_size as usize
    }

    /// Load config from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        Self::load_from(config_path())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) if config.validate().is_ok() => {
                    log::info!("Loaded engine config from {}", path.display());
                    config
                }
                Ok(_) => {
                    log::warn!("Engine config at {} is invalid, using defaults", path.display());
                    Self::default()
                }
                Err(e) => {
                    log::warn!("Failed to parse engine config ({}), using defaults", e);
                    Self::default()
                }
            },
            Err(e) => {
                log::info!("No engine config found ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Save config to disk as pretty JSON.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(config_path())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

/// Which stream's position is authoritative for alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterSource {
    Slot(usize),
    /// Used when the session has no player slots
    Recorder,
}

/// Per-session configuration set by `init`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub channel_count: u16,
    pub player_slots: usize,
    pub loop_playback: bool,
    pub master: MasterSource,
}

impl SessionConfig {
    /// Build from the raw `init` arguments.
    ///
    /// With zero player slots the recorder is master and `master_slot` must be 0.
    pub fn new(
        channel_count: u16,
        player_slots: usize,
        loop_playback: bool,
        master_slot: usize,
    ) -> Result<Self, EngineError> {
        validate_channels(channel_count)?;
        if player_slots > MAX_PLAYER_SLOTS {
            return Err(EngineError::InvalidConfiguration(format!(
                "{} player slots exceeds the maximum of {}",
                player_slots, MAX_PLAYER_SLOTS
            )));
        }
        let master = if player_slots == 0 {
            if master_slot != 0 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "master slot {} given but the session has no player slots",
                    master_slot
                )));
            }
            MasterSource::Recorder
        } else if master_slot >= player_slots {
            return Err(EngineError::InvalidConfiguration(format!(
                "master slot {} out of range for {} player slots",
                master_slot, player_slots
            )));
        } else {
            MasterSource::Slot(master_slot)
        };
        Ok(Self {
            channel_count,
            player_slots,
            loop_playback,
            master,
        })
    }

    /// Record-only session with the recorder as master
    pub fn record_only(channel_count: u16) -> Self {
        Self {
            channel_count,
            player_slots: 0,
            loop_playback: false,
            master: MasterSource::Recorder,
        }
    }

    pub fn master_slot(&self) -> Option<usize> {
        match self.master {
            MasterSource::Slot(i) => Some(i),
            MasterSource::Recorder => None,
        }
    }
}

fn validate_channels(channels: u16) -> Result<(), EngineError> {
    if channels == 1 || channels == 2 {
        Ok(())
    } else {
        Err(EngineError::InvalidConfiguration(format!(
            "channel count must be 1 or 2, got {}",
            channels
        )))
    }
}
