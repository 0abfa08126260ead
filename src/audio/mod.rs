//! Audio module - the real-time side of the engine
//!
//! This module provides:
//! - Lock-free command/event queues between control and audio threads
//! - Track decoding and capture file writing
//! - The transport clock, player bank and recorder
//! - The per-tick processor and the cpal device that drives it

mod clock;
mod device;
mod player;
mod processor;
mod queue;
mod recorder;
mod track;

pub use clock::TransportClock;
pub use device::AudioDevice;
pub use player::{PlayerBank, PlayerSlot};
pub use processor::AudioProcessor;
pub use queue::{
    command_queue, event_queue, Command, CommandReceiver, CommandSender, EventReceiver,
    EventSender, RtEvent, QUEUE_CAPACITY,
};
pub use recorder::{capture_ring, CaptureGap, CaptureSink, CaptureSource, Recorder};
pub use track::{promote, to_pcm16, CaptureWriter, Track, TrackError};
