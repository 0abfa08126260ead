//! Lock-free hand-off between the control thread and the audio callback
//!
//! Both directions are SPSC rings from the `ringbuf` crate:
//! - [`CommandSender`] / [`CommandReceiver`]: control -> real-time. Commands
//!   are popped only at the start of a tick, so a mix is never torn by a
//!   state change.
//! - [`EventSender`] / [`EventReceiver`]: real-time -> control. Events are
//!   drained on the control thread, FIFO.
//!
//! Neither side ever waits for the other. A full ring fails the push and the
//! caller decides what to do with the rejected value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use basedrop::Shared;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapRb,
};

use super::recorder::CaptureSink;
use super::track::Track;

/// Default capacity of both rings
pub const QUEUE_CAPACITY: usize = 256;

/// Commands sent from the control thread to the audio thread
pub enum Command {
    /// Replace the session layout. Unbinds every slot and rewinds the clock.
    Configure {
        generation: u64,
        slots: usize,
        loop_playback: bool,
        master: Option<usize>,
        channels: u16,
    },
    /// Attach a decoded track to a slot
    BindTrack { slot: usize, track: Shared<Track> },
    /// Play or pause every bound slot
    SetPlaying(bool),
    /// Move every slot back to frame 0
    Rewind,
    /// Begin pushing input frames into `sink`
    StartCapture { job: u64, sink: CaptureSink },
    StopCapture,
    /// Drop the session; a running capture is handed back as stopped
    Reset { generation: u64 },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configure { generation, slots, .. } => {
                write!(f, "Configure(gen={}, slots={})", generation, slots)
            }
            Self::BindTrack { slot, .. } => write!(f, "BindTrack({})", slot),
            Self::SetPlaying(play) => write!(f, "SetPlaying({})", play),
            Self::Rewind => write!(f, "Rewind"),
            Self::StartCapture { job, .. } => write!(f, "StartCapture(job={})", job),
            Self::StopCapture => write!(f, "StopCapture"),
            Self::Reset { generation } => write!(f, "Reset(gen={})", generation),
        }
    }
}

/// Events produced on the audio thread
pub enum RtEvent {
    /// A slot reached the end of its track (once per loop wrap)
    PlayerEnded { generation: u64, slot: usize },
    /// Capture for `job` ended after `frames` frames. The ring producer is
    /// returned so it is freed on the control thread.
    CaptureStopped {
        job: u64,
        frames: u64,
        overruns: u64,
        sink: CaptureSink,
    },
}

impl std::fmt::Debug for RtEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlayerEnded { generation, slot } => {
                write!(f, "PlayerEnded(gen={}, slot={})", generation, slot)
            }
            Self::CaptureStopped { job, frames, .. } => {
                write!(f, "CaptureStopped(job={}, frames={})", job, frames)
            }
        }
    }
}

/// Producer half of the command queue (owned by the control thread)
pub struct CommandSender {
    producer: ringbuf::HeapProd<Command>,
}

impl CommandSender {
    /// Push a command. Returns it back if the queue is full.
    pub fn send(&mut self, command: Command) -> Result<(), Command> {
        log::debug!("-> {:?}", command);
        self.producer.try_push(command)
    }
}

/// Consumer half of the command queue (owned by the audio thread)
pub struct CommandReceiver {
    consumer: ringbuf::HeapCons<Command>,
}

impl CommandReceiver {
    #[inline]
    pub fn pop(&mut self) -> Option<Command> {
        self.consumer.try_pop()
    }
}

/// Create a command queue with the given capacity
pub fn command_queue(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (producer, consumer) = HeapRb::<Command>::new(capacity).split();
    (CommandSender { producer }, CommandReceiver { consumer })
}

/// Producer half of the event queue (owned by the audio thread)
pub struct EventSender {
    producer: ringbuf::HeapProd<RtEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Post an event. Returns it back if the queue is full.
    #[inline]
    pub fn post(&mut self, event: RtEvent) -> Result<(), RtEvent> {
        self.producer.try_push(event)
    }

    /// Post a `PlayerEnded`, counting it as dropped if the queue is full.
    ///
    /// Never used for `CaptureStopped`: that one owns the capture ring and
    /// must reach the control thread.
    #[inline]
    pub fn post_or_drop(&mut self, event: RtEvent) {
        debug_assert!(matches!(event, RtEvent::PlayerEnded { .. }));
        if self.producer.try_push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Consumer half of the event queue (owned by the control thread)
pub struct EventReceiver {
    consumer: ringbuf::HeapCons<RtEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    pub fn pop(&mut self) -> Option<RtEvent> {
        self.consumer.try_pop()
    }

    /// Events dropped since the last call
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

/// Create an event queue with the given capacity
pub fn event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (producer, consumer) = HeapRb::<RtEvent>::new(capacity).split();
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventSender {
            producer,
            dropped: Arc::clone(&dropped),
        },
        EventReceiver { consumer, dropped },
    )
}
