//! The per-tick real-time entry point
//!
//! [`AudioProcessor::process`] is what the audio callback calls once per
//! tick. Order inside a tick:
//! 1. apply every queued command (tick boundary, never mid-mix)
//! 2. mix playing slots into the output
//! 3. capture the input at the same transport position
//! 4. advance the transport clock
//!
//! Nothing here blocks, allocates or logs.

use std::collections::VecDeque;

use super::clock::TransportClock;
use super::player::PlayerBank;
use super::queue::{Command, CommandReceiver, EventSender, RtEvent};
use super::recorder::Recorder;

/// Room for stop events that found the event queue full. Command processing
/// pauses while it is full, so a stop event is never dropped.
const STALLED_CAPACITY: usize = 16;

pub struct AudioProcessor {
    commands: CommandReceiver,
    events: EventSender,
    clock: TransportClock,
    bank: PlayerBank,
    recorder: Recorder,
    /// Device channel count for both input and output
    channels: usize,
    max_frames: usize,
    /// Capture-stopped events waiting for room in the event queue
    stalled: VecDeque<RtEvent>,
}

impl AudioProcessor {
    pub fn new(
        commands: CommandReceiver,
        events: EventSender,
        channels: u16,
        max_frames: usize,
    ) -> Self {
        let mut recorder = Recorder::new(max_frames);
        recorder.set_channels(channels);
        Self {
            commands,
            events,
            clock: TransportClock::new(),
            bank: PlayerBank::new(),
            recorder,
            channels: channels as usize,
            max_frames,
            stalled: VecDeque::with_capacity(STALLED_CAPACITY),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Largest tick `process` accepts, in frames
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Transport position in frames
    pub fn position(&self) -> u64 {
        self.clock.position()
    }

    pub fn bank(&self) -> &PlayerBank {
        &self.bank
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Run one tick.
    ///
    /// `input` and `output` are interleaved at the device channel count.
    /// Frames beyond [`max_frames`](Self::max_frames) are left silent.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        self.flush_stalled();
        self.apply_commands();

        output.fill(0.0);
        let frames = (output.len() / self.channels).min(self.max_frames);
        if frames == 0 {
            return;
        }
        if !self.bank.any_playing() && !self.recorder.is_capturing() {
            return;
        }

        let tick = self.clock.position();
        let output = &mut output[..frames * self.channels];
        self.bank.process(output, self.channels, &mut self.events);
        self.recorder.process(input, self.channels, frames, tick);
        self.clock.advance(frames);
    }

    fn apply_commands(&mut self) {
        // Each command stalls at most one event; the rest wait for a later tick
        while self.stalled.len() < STALLED_CAPACITY {
            let Some(command) = self.commands.pop() else {
                break;
            };
            match command {
                Command::Configure {
                    generation,
                    slots,
                    loop_playback,
                    master,
                    channels,
                } => {
                    self.bank.configure(generation, slots, loop_playback, master);
                    self.recorder.set_channels(channels);
                    self.clock.reset();
                }
                Command::BindTrack { slot, track } => self.bank.bind(slot, track),
                Command::SetPlaying(playing) => self.bank.set_playing(playing),
                Command::Rewind => self.bank.rewind(),
                Command::StartCapture { job, sink } => {
                    if let Some(event) = self.recorder.start(job, sink) {
                        self.post(event);
                    }
                }
                Command::StopCapture => {
                    if let Some(event) = self.recorder.stop() {
                        self.post(event);
                    }
                }
                Command::Reset { generation } => {
                    self.bank.clear();
                    self.bank.set_generation(generation);
                    self.clock.reset();
                    if let Some(event) = self.recorder.stop() {
                        self.post(event);
                    }
                }
            }
        }
    }

    /// Post an event that must not be lost
    fn post(&mut self, event: RtEvent) {
        if self.stalled.is_empty() {
            if let Err(event) = self.events.post(event) {
                self.stall(event);
            }
        } else {
            // Keep FIFO order behind the events already waiting
            self.stall(event);
        }
    }

    fn stall(&mut self, event: RtEvent) {
        // Capacity is reserved by `apply_commands`, so this never allocates
        self.stalled.push_back(event);
    }

    fn flush_stalled(&mut self) {
        while let Some(event) = self.stalled.pop_front() {
            if let Err(event) = self.events.post(event) {
                self.stalled.push_front(event);
                break;
            }
        }
    }
}
