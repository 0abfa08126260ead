//! Session engine - the control side
//!
//! [`SessionEngine`] is the single object a host talks to. It validates every
//! command against the session state machine, turns it into real-time
//! [`Command`]s, and collects everything that happens elsewhere (decode
//! workers, the capture writer, the audio thread, device errors) into one
//! FIFO of [`Notification`]s drained on the caller's thread.
//!
//! ```text
//! Idle --init--> Preparing --(all slots prepared)--> Ready
//! Ready --startPlaying/setPlay(true)--> Playing --setPlay(false)--> Ready
//! Ready/Idle --startRecording--> Recording --stopRecording--> Ready
//! any --reset--> Idle;  any --release--> (terminal)
//! ```
//!
//! Nothing here runs on the audio thread. The engine hands the real-time half
//! ([`AudioProcessor`]) either to a cpal device via [`SessionEngine::open_device`]
//! or to the host via [`SessionEngine::take_processor`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::thread;

use basedrop::{Collector, Shared};
use crossbeam::channel::{self, Receiver, Sender};

use crate::audio::{
    capture_ring, command_queue, event_queue, AudioDevice, AudioProcessor, CaptureSink,
    CaptureWriter, Command, CommandSender, EventReceiver, RtEvent, Track, TrackError,
    QUEUE_CAPACITY,
};
use crate::config::{EngineConfig, SessionConfig};
use crate::error::{EngineError, ErrorKind};

/// Seconds of audio the capture ring can buffer ahead of the writer thread
const CAPTURE_RING_SECONDS: usize = 4;

/// Session state. Exactly one value at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Ready,
    Playing,
    Recording,
}

/// Asynchronous notifications delivered on the control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    PlayersPrepared,
    Error(ErrorKind),
    PlayerEnded(usize),
    RecordFinished,
}

/// Receives notifications from [`SessionEngine::dispatch_notifications`].
///
/// Every method gets the engine back, so a listener can issue the next
/// command (e.g. start recording once players are prepared).
pub trait EngineListener {
    fn on_players_prepared(&mut self, _engine: &mut SessionEngine) {}
    fn on_error(&mut self, _engine: &mut SessionEngine, _kind: ErrorKind) {}
    fn on_player_ended(&mut self, _engine: &mut SessionEngine, _slot: usize) {}
    fn on_record_finished(&mut self, _engine: &mut SessionEngine) {}
}

/// Messages from worker threads to the control thread
enum WorkerEvent {
    TrackDecoded {
        generation: u64,
        slot: usize,
        result: Result<Track, EngineError>,
    },
    RecordingFinalized {
        job: u64,
        result: Result<u64, TrackError>,
    },
    DeviceLost(String),
}

/// Control-side view of a player slot
enum SlotBinding {
    Empty,
    Decoding,
    Bound(Shared<Track>),
}

/// A recording from `startRecording` until its file is promoted or discarded
pub struct RecordingJob {
    id: u64,
    temp_path: PathBuf,
    dest_path: PathBuf,
    frames_written: u64,
    active: bool,
    writer: CaptureWriter,
}

impl RecordingJob {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    /// Frames captured, known once the audio thread has acknowledged the stop
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// True until `stopRecording`
    pub fn is_active(&self) -> bool {
        self.active
    }
}

pub struct SessionEngine {
    /// Fixed device configuration
    config: EngineConfig,
    /// Layout set by the last successful `init`
    session: Option<SessionConfig>,
    state: SessionState,
    /// Bumped by `init` and `reset`; late results from older sessions are dropped
    generation: u64,
    /// Control-side view of each configured slot
    slots: Vec<SlotBinding>,

    /// Control -> audio thread
    commands: CommandSender,
    /// Audio thread -> control
    events: EventReceiver,
    /// Real-time half until a device or the host takes it
    processor: Option<AudioProcessor>,
    /// Running cpal streams, when opened by the engine
    device: Option<AudioDevice>,
    /// Set on device loss; cleared by `reset`
    device_failed: bool,

    /// Cloned into decode workers, capture writers and device callbacks
    worker_tx: Sender<WorkerEvent>,
    worker_rx: Receiver<WorkerEvent>,
    /// Frees tracks the audio thread let go of
    collector: Collector,

    /// The take being captured right now
    recording: Option<RecordingJob>,
    /// Stopped takes whose files are still being written
    finalizing: Vec<RecordingJob>,
    /// Id for the next recording; matches stop events to jobs
    next_job: u64,

    /// Notifications not yet handed to the caller
    pending: VecDeque<Notification>,
    released: bool,
}

impl SessionEngine {
    /// Create an engine for a device with the given fixed configuration.
    ///
    /// No audio I/O is opened yet; see [`open_device`](Self::open_device).
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let (commands, command_rx) = command_queue(QUEUE_CAPACITY);
        let (event_tx, events) = event_queue(QUEUE_CAPACITY);
        let processor = AudioProcessor::new(
            command_rx,
            event_tx,
            config.channel_count,
            config.frames_per_tick(),
        );
        let (worker_tx, worker_rx) = channel::unbounded();

        log::info!(
            "Engine created: {} Hz, {} frames/tick, {} ch",
            config.sample_rate,
            config.buffer_size,
            config.channel_count
        );

        Ok(Self {
            config,
            session: None,
            state: SessionState::Idle,
            generation: 0,
            slots: Vec::new(),
            commands,
            events,
            processor: Some(processor),
            device: None,
            device_failed: false,
            worker_tx,
            worker_rx,
            collector: Collector::new(),
            recording: None,
            finalizing: Vec::new(),
            next_job: 1,
            pending: VecDeque::new(),
            released: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&SessionConfig> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The active recording, if any
    pub fn recording(&self) -> Option<&RecordingJob> {
        self.recording.as_ref()
    }

    /// Track bound to `slot`, once prepared
    pub fn track(&self, slot: usize) -> Option<&Track> {
        match self.slots.get(slot) {
            Some(SlotBinding::Bound(track)) => Some(&**track),
            _ => None,
        }
    }

    /// Hand the real-time processor to a host-owned audio callback.
    ///
    /// Returns `None` once a device has been opened or the processor was
    /// already taken.
    pub fn take_processor(&mut self) -> Option<AudioProcessor> {
        self.processor.take()
    }

    /// Open the default cpal devices and start audio I/O
    pub fn open_device(&mut self) -> Result<(), EngineError> {
        self.ensure_live()?;
        if self.device.is_some() {
            return Ok(());
        }
        let Some(processor) = self.processor.take() else {
            return self.fail(EngineError::Device(
                "audio processor is owned by the host".to_string(),
            ));
        };

        let tx = self.worker_tx.clone();
        let on_error = move |msg: String| {
            let _ = tx.send(WorkerEvent::DeviceLost(msg));
        };
        match AudioDevice::open(&self.config, processor, on_error) {
            Ok(device) => {
                self.device = Some(device);
                Ok(())
            }
            Err(e) => {
                // The processor went down with the failed device
                self.device_failed = true;
                self.fail(e)
            }
        }
    }

    /// Configure a new session, replacing the previous one.
    ///
    /// With zero player slots the session is Ready at once and
    /// `PlayersPrepared` is queued immediately.
    pub fn init(
        &mut self,
        channel_count: u16,
        player_slots: usize,
        loop_playback: bool,
        master_slot: usize,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        let session =
            match SessionConfig::new(channel_count, player_slots, loop_playback, master_slot) {
                Ok(session) => session,
                Err(e) => return self.fail(e),
            };
        if self.state != SessionState::Idle {
            log::debug!("init while {:?}, resetting first", self.state);
            self.reset_session();
        }
        self.begin_session(session)
    }

    /// Decode `path` into the next unbound slot, off the calling thread.
    ///
    /// `offset` and `length` select a byte range of the file holding the
    /// container; `length == 0` means to the end of the file.
    pub fn prepare_player(
        &mut self,
        path: impl AsRef<Path>,
        offset: u64,
        length: u64,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        if self.state != SessionState::Preparing {
            return self.fail(EngineError::InvalidState {
                op: "prepare player",
                state: self.state,
            });
        }
        let Some(slot) = self
            .slots
            .iter()
            .position(|s| matches!(s, SlotBinding::Empty))
        else {
            let e = EngineError::InvalidConfiguration(format!(
                "all {} player slots are already bound",
                self.slots.len()
            ));
            return self.fail(e);
        };

        let path = path.as_ref().to_path_buf();
        let generation = self.generation;
        let target_rate = self.config.sample_rate;
        let tx = self.worker_tx.clone();
        let thread_path = path.clone();
        let spawned = thread::Builder::new()
            .name(format!("overdub-decode-{}", slot))
            .spawn(move || {
                let result = Track::load_range(&thread_path, offset, length)
                    .and_then(|track| track.resampled(target_rate))
                    .map_err(|source| EngineError::Decode {
                        path: thread_path.clone(),
                        source,
                    });
                let _ = tx.send(WorkerEvent::TrackDecoded {
                    generation,
                    slot,
                    result,
                });
            });

        match spawned {
            Ok(_) => {
                log::info!("Preparing slot {} from {:?}", slot, path);
                self.slots[slot] = SlotBinding::Decoding;
                Ok(())
            }
            Err(e) => self.fail(EngineError::Decode {
                path,
                source: TrackError::Io(e),
            }),
        }
    }

    /// Rewind every slot and start playback. No-op while already playing.
    pub fn start_playing(&mut self) -> Result<(), EngineError> {
        self.ensure_live()?;
        match self.state {
            SessionState::Playing => Ok(()),
            SessionState::Ready if self.all_bound() => {
                self.send(Command::Rewind)?;
                self.send(Command::SetPlaying(true))?;
                self.state = SessionState::Playing;
                log::info!("Playing");
                Ok(())
            }
            state => self.fail(EngineError::InvalidState {
                op: "start playing",
                state,
            }),
        }
    }

    /// Pause or resume the prepared slots without rewinding
    pub fn set_play(&mut self, should_play: bool) -> Result<(), EngineError> {
        self.ensure_live()?;
        match (self.state, should_play) {
            (SessionState::Ready, true) if self.all_bound() => {
                self.send(Command::SetPlaying(true))?;
                self.state = SessionState::Playing;
                Ok(())
            }
            (SessionState::Playing, false) => {
                self.send(Command::SetPlaying(false))?;
                self.state = SessionState::Ready;
                Ok(())
            }
            (SessionState::Ready, false) | (SessionState::Playing, true) => Ok(()),
            (state, _) => self.fail(EngineError::InvalidState {
                op: "set play",
                state,
            }),
        }
    }

    /// Start capturing into `temp_path`; the finished file lands at `dest_path`.
    ///
    /// From Idle this opens a record-only session first. Prepared slots are
    /// rewound and start on the same tick as the capture.
    pub fn start_recording(
        &mut self,
        temp_path: impl AsRef<Path>,
        dest_path: impl AsRef<Path>,
    ) -> Result<(), EngineError> {
        self.ensure_live()?;
        match self.state {
            SessionState::Idle => {
                self.begin_session(SessionConfig::record_only(self.config.channel_count))?;
                // Nobody asked for this prepare notification
                self.pending
                    .retain(|n| *n != Notification::PlayersPrepared);
            }
            SessionState::Ready if self.all_bound() => {}
            state => {
                return self.fail(EngineError::InvalidState {
                    op: "start recording",
                    state,
                })
            }
        }
        let Some(session) = self.session else {
            return self.fail(EngineError::InvalidState {
                op: "start recording",
                state: self.state,
            });
        };

        let temp_path = temp_path.as_ref().to_path_buf();
        let dest_path = dest_path.as_ref().to_path_buf();
        let job = self.next_job;
        self.next_job += 1;

        let capacity = self.config.sample_rate as usize
            * session.channel_count as usize
            * CAPTURE_RING_SECONDS;
        let (sink, source) = capture_ring(capacity);
        let tx = self.worker_tx.clone();
        let writer = match CaptureWriter::spawn(
            &temp_path,
            &dest_path,
            session.channel_count,
            self.config.sample_rate,
            source,
            move |result| {
                let _ = tx.send(WorkerEvent::RecordingFinalized { job, result });
            },
        ) {
            Ok(writer) => writer,
            Err(e) => return self.fail(EngineError::Recording(e)),
        };

        if let Err(e) = self.queue_capture(job, sink, session.player_slots > 0) {
            writer.abandon();
            return Err(e);
        }

        log::info!("Recording {:?} (via {:?})", dest_path, temp_path);
        self.recording = Some(RecordingJob {
            id: job,
            temp_path,
            dest_path,
            frames_written: 0,
            active: true,
            writer,
        });
        self.state = SessionState::Recording;
        Ok(())
    }

    /// Stop capturing. `RecordFinished` follows once the file is in place.
    pub fn stop_recording(&mut self) -> Result<(), EngineError> {
        self.ensure_live()?;
        if self.state != SessionState::Recording {
            return self.fail(EngineError::InvalidState {
                op: "stop recording",
                state: self.state,
            });
        }
        self.send(Command::StopCapture)?;
        if self.slots.is_empty() {
            log::debug!("Record-only session, no players to pause");
        } else {
            self.send(Command::SetPlaying(false))?;
        }
        if let Some(mut job) = self.recording.take() {
            job.active = false;
            self.finalizing.push(job);
        }
        self.state = SessionState::Ready;
        log::info!("Recording stopped");
        Ok(())
    }

    /// Return to Idle, dropping all slots and abandoning any unfinished
    /// recording. Temp files are gone when this returns.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        if self.released {
            return Err(EngineError::Released);
        }
        self.reset_session();
        Ok(())
    }

    /// Stop audio I/O and free everything. The engine is unusable afterwards.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.reset_session();
        self.device = None;
        self.processor = None;
        self.collector.collect();
        self.released = true;
        log::info!("Engine released");
    }

    /// Report that the audio device stopped working.
    ///
    /// For hosts driving the processor from their own callback; the engine's
    /// own device reports itself. Commands fail with `DeviceFailure` until
    /// [`reset`](Self::reset), which also replaces the processor, so such a
    /// host must call [`take_processor`](Self::take_processor) again.
    pub fn report_device_lost(&mut self, reason: impl Into<String>) {
        self.handle_worker_event(WorkerEvent::DeviceLost(reason.into()));
    }

    /// True when Ready (or later) with every configured slot bound
    pub fn is_prepared(&self) -> bool {
        matches!(
            self.state,
            SessionState::Ready | SessionState::Playing | SessionState::Recording
        ) && self.all_bound()
    }

    /// Next notification, after collecting everything the workers and the
    /// audio thread have produced
    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.pump();
        self.pending.pop_front()
    }

    /// Deliver every pending notification to `listener`, in order.
    /// Returns how many were delivered.
    pub fn dispatch_notifications<L: EngineListener + ?Sized>(&mut self, listener: &mut L) -> usize {
        let mut delivered = 0;
        while let Some(notification) = self.poll_notification() {
            match notification {
                Notification::PlayersPrepared => listener.on_players_prepared(self),
                Notification::Error(kind) => listener.on_error(self, kind),
                Notification::PlayerEnded(slot) => listener.on_player_ended(self, slot),
                Notification::RecordFinished => listener.on_record_finished(self),
            }
            delivered += 1;
        }
        delivered
    }

    fn begin_session(&mut self, session: SessionConfig) -> Result<(), EngineError> {
        self.generation += 1;
        self.send(Command::Configure {
            generation: self.generation,
            slots: session.player_slots,
            loop_playback: session.loop_playback,
            master: session.master_slot(),
            channels: session.channel_count,
        })?;
        self.slots = (0..session.player_slots).map(|_| SlotBinding::Empty).collect();
        self.session = Some(session);

        if session.player_slots == 0 {
            self.state = SessionState::Ready;
            self.pending.push_back(Notification::PlayersPrepared);
        } else {
            self.state = SessionState::Preparing;
        }
        log::info!(
            "Session {}: {} slots, {} ch, loop={}, master={:?}",
            self.generation,
            session.player_slots,
            session.channel_count,
            session.loop_playback,
            session.master
        );
        Ok(())
    }

    fn reset_session(&mut self) {
        self.generation += 1;

        if self.device_failed {
            // The processor died with the device; start over with fresh queues
            self.device = None;
            // Errors the dead streams reported before they stopped
            self.worker_rx.try_iter().for_each(drop);
            self.rebuild_pipeline();
        } else if self
            .send(Command::Reset {
                generation: self.generation,
            })
            .is_err()
        {
            log::warn!("Command queue full during reset");
        }

        if let Some(job) = self.recording.take() {
            log::info!("Abandoning recording to {:?}", job.dest_path);
            job.writer.abandon();
        }
        for job in self.finalizing.drain(..) {
            job.writer.abandon();
        }

        self.slots.clear();
        self.session = None;
        self.state = SessionState::Idle;
        self.pending.clear();
        self.collector.collect();
        log::debug!("Reset to generation {}", self.generation);
    }

    fn rebuild_pipeline(&mut self) {
        let (commands, command_rx) = command_queue(QUEUE_CAPACITY);
        let (event_tx, events) = event_queue(QUEUE_CAPACITY);
        self.processor = Some(AudioProcessor::new(
            command_rx,
            event_tx,
            self.config.channel_count,
            self.config.frames_per_tick(),
        ));
        self.commands = commands;
        self.events = events;
        self.device_failed = false;
    }

    /// Collect worker results and audio-thread events into `pending`
    fn pump(&mut self) {
        while let Ok(event) = self.worker_rx.try_recv() {
            self.handle_worker_event(event);
        }
        while let Some(event) = self.events.pop() {
            self.handle_rt_event(event);
        }
        let dropped = self.events.take_dropped();
        if dropped > 0 {
            log::warn!("Audio thread dropped {} events", dropped);
        }
        self.collector.collect();
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::TrackDecoded {
                generation,
                slot,
                result,
            } => {
                if generation != self.generation {
                    log::debug!("Discarding stale decode for slot {}", slot);
                    return;
                }
                match result {
                    Ok(track) => self.bind_track(slot, track),
                    Err(e) => {
                        log::warn!("Slot {} failed to prepare: {}", slot, e);
                        if let Some(binding) = self.slots.get_mut(slot) {
                            *binding = SlotBinding::Empty;
                        }
                        self.pending.push_back(Notification::Error(e.kind()));
                    }
                }
            }
            WorkerEvent::RecordingFinalized { job, result } => {
                if self.recording.as_ref().is_some_and(|j| j.id == job) {
                    match result {
                        Err(e) => self.abort_recording(e),
                        Ok(_) => log::warn!("Recording {} finished before it was stopped", job),
                    }
                    return;
                }
                let Some(index) = self.finalizing.iter().position(|j| j.id == job) else {
                    log::debug!("Ignoring result of abandoned recording {}", job);
                    return;
                };
                let job = self.finalizing.remove(index);
                job.writer.join();
                match result {
                    Ok(frames) => {
                        log::info!("Recording finished: {:?} ({} frames)", job.dest_path, frames);
                        self.pending.push_back(Notification::RecordFinished);
                    }
                    Err(e) => {
                        log::error!("Recording to {:?} failed: {}", job.dest_path, e);
                        self.pending
                            .push_back(Notification::Error(EngineError::Recording(e).kind()));
                    }
                }
            }
            WorkerEvent::DeviceLost(msg) => {
                if self.device_failed {
                    return;
                }
                log::error!("Audio device lost: {}", msg);
                self.device_failed = true;
                self.pending
                    .push_back(Notification::Error(ErrorKind::DeviceFailure));
            }
        }
    }

    /// The writer thread failed while the take was still running
    fn abort_recording(&mut self, error: TrackError) {
        let Some(job) = self.recording.take() else {
            return;
        };
        log::error!("Recording to {:?} failed mid-take: {}", job.dest_path, error);
        // A full queue already reports itself through `send`
        let _ = self.send(Command::StopCapture);
        if !self.slots.is_empty() {
            let _ = self.send(Command::SetPlaying(false));
        }
        job.writer.abandon();
        self.state = SessionState::Ready;
        self.pending
            .push_back(Notification::Error(EngineError::Recording(error).kind()));
    }

    fn bind_track(&mut self, slot: usize, track: Track) {
        let track = Shared::new(&self.collector.handle(), track);
        if let Err(e) = self.send(Command::BindTrack {
            slot,
            track: track.clone(),
        }) {
            self.slots[slot] = SlotBinding::Empty;
            self.pending.push_back(Notification::Error(e.kind()));
            return;
        }
        self.slots[slot] = SlotBinding::Bound(track);
        log::info!("Slot {} prepared", slot);

        if self.state == SessionState::Preparing && self.all_bound() {
            self.state = SessionState::Ready;
            self.pending.push_back(Notification::PlayersPrepared);
            log::info!("All {} players prepared", self.slots.len());
        }
    }

    fn handle_rt_event(&mut self, event: RtEvent) {
        match event {
            RtEvent::PlayerEnded { generation, slot } => {
                if generation != self.generation {
                    return;
                }
                self.pending.push_back(Notification::PlayerEnded(slot));

                let Some(session) = self.session else {
                    return;
                };
                if session.loop_playback || session.master_slot() != Some(slot) {
                    return;
                }
                match self.state {
                    SessionState::Recording => {
                        log::info!("Master slot {} ended, stopping recording", slot);
                        if let Err(e) = self.stop_recording() {
                            log::warn!("Auto-stop failed: {}", e);
                        }
                    }
                    SessionState::Playing => {
                        log::info!("Master slot {} ended", slot);
                        if self.send(Command::SetPlaying(false)).is_ok() {
                            self.state = SessionState::Ready;
                        }
                    }
                    _ => {}
                }
            }
            RtEvent::CaptureStopped {
                job,
                frames,
                overruns,
                sink,
            } => {
                // Free the ring here, not on the audio thread
                drop(sink);
                if overruns > 0 {
                    log::warn!("Recording {} overran the capture ring by {} frames", job, overruns);
                }
                match self.finalizing.iter_mut().find(|j| j.id == job) {
                    Some(recording) => {
                        recording.frames_written = frames;
                        recording.writer.finish(frames);
                        log::debug!("Capture {} stopped after {} frames", job, frames);
                    }
                    None => log::debug!("Capture {} stopped after its recording was dropped", job),
                }
            }
        }
    }

    /// Rewind, capture and play land on the same tick boundary
    fn queue_capture(
        &mut self,
        job: u64,
        sink: CaptureSink,
        has_players: bool,
    ) -> Result<(), EngineError> {
        if has_players {
            self.send(Command::Rewind)?;
        }
        self.send(Command::StartCapture { job, sink })?;
        if has_players {
            self.send(Command::SetPlaying(true))?;
        }
        Ok(())
    }

    fn all_bound(&self) -> bool {
        self.slots.iter().all(|s| matches!(s, SlotBinding::Bound(_)))
    }

    fn send(&mut self, command: Command) -> Result<(), EngineError> {
        match self.commands.send(command) {
            Ok(()) => Ok(()),
            Err(_) => self.fail(EngineError::CommandQueueFull),
        }
    }

    /// Queue the error for `onError` and return it
    fn fail<T>(&mut self, error: EngineError) -> Result<T, EngineError> {
        log::warn!("{}", error);
        self.pending.push_back(Notification::Error(error.kind()));
        Err(error)
    }

    fn ensure_live(&mut self) -> Result<(), EngineError> {
        if self.released {
            return Err(EngineError::Released);
        }
        if self.device_failed {
            return self.fail(EngineError::Device(
                "device lost, reset or release the engine".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const BUFFER: u32 = 64;

    fn engine() -> (SessionEngine, AudioProcessor) {
        let config = EngineConfig {
            sample_rate: 8000,
            buffer_size: BUFFER,
            channel_count: 2,
            low_latency: false,
        };
        let mut engine = SessionEngine::new(config).unwrap();
        let processor = engine.take_processor().unwrap();
        (engine, processor)
    }

    fn write_wav(path: &Path, frames: usize) {
        write_wav_at(path, frames, 8000);
    }

    fn write_wav_at(path: &Path, frames: usize, sample_rate: u32) {
        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for _ in 0..frames * 2 {
            writer.write_sample(1000i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn wav_frames(path: &Path) -> u32 {
        hound::WavReader::open(path).unwrap().duration()
    }

    fn tick(processor: &mut AudioProcessor, ticks: usize) {
        let input = vec![0.25f32; BUFFER as usize * 2];
        let mut output = vec![0.0f32; BUFFER as usize * 2];
        for _ in 0..ticks {
            processor.process(&input, &mut output);
        }
    }

    /// Poll until `want` arrives, returning everything seen up to and including it
    fn wait_for(engine: &mut SessionEngine, want: Notification) -> Vec<Notification> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            while let Some(n) = engine.poll_notification() {
                seen.push(n);
                if n == want {
                    return seen;
                }
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for {:?}, saw {:?}", want, seen);
    }

    /// Collect notifications for a fixed time
    fn drain_for(engine: &mut SessionEngine, wait: Duration) -> Vec<Notification> {
        let deadline = Instant::now() + wait;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            while let Some(n) = engine.poll_notification() {
                seen.push(n);
            }
            thread::sleep(Duration::from_millis(2));
        }
        seen
    }

    fn fixture(dir: &TempDir, name: &str, frames: usize) -> PathBuf {
        let path = dir.path().join(name);
        write_wav(&path, frames);
        path
    }

    #[test]
    fn test_record_beat() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        let beat = dir.path().join("beat");
        let (mut engine, mut processor) = engine();

        engine.init(2, 0, true, 0).unwrap();
        assert_eq!(engine.state(), SessionState::Ready);
        assert_eq!(engine.poll_notification(), Some(Notification::PlayersPrepared));

        engine.start_recording(&temp, &beat).unwrap();
        assert_eq!(engine.state(), SessionState::Recording);
        assert!(engine.recording().unwrap().is_active());
        tick(&mut processor, 50);
        engine.stop_recording().unwrap();
        assert_eq!(engine.state(), SessionState::Ready);
        tick(&mut processor, 1);

        wait_for(&mut engine, Notification::RecordFinished);
        assert_eq!(wav_frames(&beat), 50 * BUFFER);
        assert!(!temp.exists());
    }

    #[test]
    fn test_record_from_idle() {
        let dir = tempfile::tempdir().unwrap();
        let beat = dir.path().join("beat");
        let (mut engine, mut processor) = engine();

        engine.start_recording(dir.path().join("temp"), &beat).unwrap();
        assert_eq!(engine.state(), SessionState::Recording);
        tick(&mut processor, 3);
        engine.stop_recording().unwrap();
        tick(&mut processor, 1);

        let seen = wait_for(&mut engine, Notification::RecordFinished);
        assert!(!seen.contains(&Notification::PlayersPrepared));
        assert_eq!(wav_frames(&beat), 3 * BUFFER);
    }

    #[test]
    fn test_immediate_stop_still_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let beat = dir.path().join("beat");
        let (mut engine, mut processor) = engine();

        engine.init(2, 0, true, 0).unwrap();
        engine.start_recording(dir.path().join("temp"), &beat).unwrap();
        engine.stop_recording().unwrap();
        tick(&mut processor, 1);

        wait_for(&mut engine, Notification::RecordFinished);
        assert_eq!(wav_frames(&beat), 0);
    }

    #[test]
    fn test_players_prepared_once_after_all_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _processor) = engine();
        let a = fixture(&dir, "a.wav", 20_000);
        let b = fixture(&dir, "b.wav", 10);
        let c = fixture(&dir, "c.wav", 500);

        engine.init(2, 3, true, 1).unwrap();
        assert_eq!(engine.state(), SessionState::Preparing);
        engine.prepare_player(&a, 0, 0).unwrap();
        engine.prepare_player(&b, 0, 0).unwrap();
        assert!(!engine.is_prepared());
        engine.prepare_player(&c, 0, 0).unwrap();

        wait_for(&mut engine, Notification::PlayersPrepared);
        assert_eq!(engine.state(), SessionState::Ready);
        assert!(engine.is_prepared());
        assert_eq!(engine.track(0).unwrap().frames(), 20_000);
        assert_eq!(engine.track(1).unwrap().frames(), 10);

        let later = drain_for(&mut engine, Duration::from_millis(50));
        assert!(!later.contains(&Notification::PlayersPrepared));

        // Every slot is bound now
        assert!(engine.prepare_player(&a, 0, 0).is_err());
    }

    #[test]
    fn test_decode_failure_keeps_preparing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _processor) = engine();
        let beat = fixture(&dir, "beat.wav", 100);

        engine.init(2, 1, true, 0).unwrap();
        engine
            .prepare_player(dir.path().join("missing.wav"), 0, 0)
            .unwrap();
        wait_for(
            &mut engine,
            Notification::Error(ErrorKind::DecodeFailure),
        );
        assert_eq!(engine.state(), SessionState::Preparing);
        assert!(engine.start_playing().is_err());

        // The failed slot can be retried with another file
        engine.prepare_player(&beat, 0, 0).unwrap();
        wait_for(&mut engine, Notification::PlayersPrepared);
        assert!(engine.is_prepared());
    }

    #[test]
    fn test_invalid_master_slot() {
        let (mut engine, _processor) = engine();
        let err = engine.init(2, 1, true, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert_eq!(engine.state(), SessionState::Idle);
        assert_eq!(
            engine.poll_notification(),
            Some(Notification::Error(ErrorKind::InvalidConfiguration))
        );

        assert!(engine.init(3, 1, true, 0).is_err());
        assert_eq!(engine.state(), SessionState::Idle);
    }

    #[test]
    fn test_record_before_prepared_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _processor) = engine();
        engine.init(2, 1, true, 0).unwrap();

        let err = engine
            .start_recording(dir.path().join("temp"), dir.path().join("voice1"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert_eq!(engine.state(), SessionState::Preparing);
        assert!(!dir.path().join("temp").exists());
    }

    #[test]
    fn test_overdub_loops_master() {
        let dir = tempfile::tempdir().unwrap();
        let beat = fixture(&dir, "beat.wav", 4 * BUFFER as usize);
        let voice1 = dir.path().join("voice1");
        let (mut engine, mut processor) = engine();

        engine.init(2, 1, true, 0).unwrap();
        engine.prepare_player(&beat, 0, 0).unwrap();
        wait_for(&mut engine, Notification::PlayersPrepared);

        engine.start_recording(dir.path().join("temp"), &voice1).unwrap();
        tick(&mut processor, 6);
        assert!(processor.bank().slot(0).unwrap().is_playing());
        assert_eq!(processor.bank().slot(0).unwrap().position(), 2 * BUFFER as usize);

        let seen = drain_for(&mut engine, Duration::from_millis(20));
        assert_eq!(
            seen.iter()
                .filter(|n| **n == Notification::PlayerEnded(0))
                .count(),
            1
        );

        tick(&mut processor, 2);
        engine.stop_recording().unwrap();
        tick(&mut processor, 1);
        let seen = wait_for(&mut engine, Notification::RecordFinished);
        assert!(seen.contains(&Notification::PlayerEnded(0)));
        assert!(!processor.bank().any_playing());

        assert_eq!(wav_frames(&voice1), 8 * BUFFER);
        assert!(wav_frames(&voice1) >= wav_frames(&beat));
    }

    #[test]
    fn test_master_end_stops_recording_without_loop() {
        let dir = tempfile::tempdir().unwrap();
        let beat = fixture(&dir, "beat.wav", 3 * BUFFER as usize);
        let voice1 = dir.path().join("voice1");
        let (mut engine, mut processor) = engine();

        engine.init(2, 1, false, 0).unwrap();
        engine.prepare_player(&beat, 0, 0).unwrap();
        wait_for(&mut engine, Notification::PlayersPrepared);

        engine.start_recording(dir.path().join("temp"), &voice1).unwrap();
        tick(&mut processor, 3);
        wait_for(&mut engine, Notification::PlayerEnded(0));
        assert_eq!(engine.state(), SessionState::Ready);

        tick(&mut processor, 1);
        wait_for(&mut engine, Notification::RecordFinished);
        assert_eq!(wav_frames(&voice1), wav_frames(&beat));
    }

    #[test]
    fn test_pause_resumes_at_same_position() {
        let dir = tempfile::tempdir().unwrap();
        let beat = fixture(&dir, "beat.wav", 100 * BUFFER as usize);
        let voice = fixture(&dir, "voice1.wav", 100 * BUFFER as usize);
        let (mut engine, mut processor) = engine();

        engine.init(2, 2, true, 1).unwrap();
        engine.prepare_player(&beat, 0, 0).unwrap();
        engine.prepare_player(&voice, 0, 0).unwrap();
        wait_for(&mut engine, Notification::PlayersPrepared);

        engine.start_playing().unwrap();
        assert_eq!(engine.state(), SessionState::Playing);
        tick(&mut processor, 3);

        engine.set_play(false).unwrap();
        assert_eq!(engine.state(), SessionState::Ready);
        tick(&mut processor, 2);
        for slot in 0..2 {
            assert_eq!(
                processor.bank().slot(slot).unwrap().position(),
                3 * BUFFER as usize
            );
        }

        engine.set_play(true).unwrap();
        tick(&mut processor, 1);
        for slot in 0..2 {
            assert_eq!(
                processor.bank().slot(slot).unwrap().position(),
                4 * BUFFER as usize
            );
        }

        // start_playing while playing is a no-op, not a rewind
        engine.start_playing().unwrap();
        tick(&mut processor, 1);
        assert_eq!(
            processor.bank().slot(0).unwrap().position(),
            5 * BUFFER as usize
        );
    }

    #[test]
    fn test_reset_is_idempotent_and_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        let dest = dir.path().join("voice2");
        let (mut engine, mut processor) = engine();

        engine.init(2, 0, true, 0).unwrap();
        engine.start_recording(&temp, &dest).unwrap();
        tick(&mut processor, 10);
        assert!(temp.exists());

        engine.reset().unwrap();
        assert_eq!(engine.state(), SessionState::Idle);
        assert!(!temp.exists());
        engine.reset().unwrap();
        assert_eq!(engine.state(), SessionState::Idle);

        // The audio thread hands back the abandoned capture; nothing is reported
        tick(&mut processor, 1);
        assert_eq!(processor.position(), 0);
        let seen = drain_for(&mut engine, Duration::from_millis(30));
        assert!(seen.is_empty(), "unexpected {:?}", seen);
        assert!(!temp.exists());
        assert!(!dest.exists());
        assert!(!engine.is_prepared());
    }

    #[test]
    fn test_late_decode_after_reset_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let beat = fixture(&dir, "beat.wav", 100);
        let (mut engine, _processor) = engine();

        engine.init(2, 1, true, 0).unwrap();
        engine.prepare_player(&beat, 0, 0).unwrap();
        engine.reset().unwrap();
        engine.init(2, 1, true, 0).unwrap();

        let seen = drain_for(&mut engine, Duration::from_millis(200));
        assert!(!seen.contains(&Notification::PlayersPrepared));
        assert_eq!(engine.state(), SessionState::Preparing);
        assert!(engine.track(0).is_none());
    }

    #[test]
    fn test_unwritable_temp_reports_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _processor) = engine();
        engine.init(2, 0, true, 0).unwrap();
        engine.poll_notification();

        let err = engine
            .start_recording(
                dir.path().join("no_such_dir").join("temp"),
                dir.path().join("beat"),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(engine.state(), SessionState::Ready);
        assert_eq!(
            engine.poll_notification(),
            Some(Notification::Error(ErrorKind::IoFailure))
        );
    }

    #[test]
    fn test_unwritable_destination_reports_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        let dest = dir.path().join("no_such_dir").join("beat");
        let (mut engine, mut processor) = engine();

        engine.init(2, 0, true, 0).unwrap();
        engine.start_recording(&temp, &dest).unwrap();
        tick(&mut processor, 2);
        engine.stop_recording().unwrap();
        tick(&mut processor, 1);

        wait_for(&mut engine, Notification::Error(ErrorKind::IoFailure));
        assert!(!dest.exists());
        assert!(!temp.exists());
    }

    #[test]
    fn test_commands_in_wrong_state() {
        let (mut engine, _processor) = engine();
        assert!(engine.stop_recording().is_err());
        assert!(engine.start_playing().is_err());
        assert!(engine.set_play(true).is_err());
        assert!(engine.prepare_player("beat.wav", 0, 0).is_err());
        assert_eq!(engine.state(), SessionState::Idle);
    }

    #[test]
    fn test_release_is_terminal() {
        let (mut engine, _processor) = engine();
        engine.init(2, 0, true, 0).unwrap();
        engine.release();
        engine.release();

        assert!(matches!(engine.init(2, 0, true, 0), Err(EngineError::Released)));
        assert!(matches!(engine.reset(), Err(EngineError::Released)));
        assert!(!engine.is_prepared());
    }

    #[test]
    fn test_writer_failure_mid_take_reports_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        let dest = dir.path().join("beat");
        let (mut engine, mut processor) = engine();

        engine.init(2, 0, true, 0).unwrap();
        engine.start_recording(&temp, &dest).unwrap();
        tick(&mut processor, 3);

        // What the writer thread sends when a write fails (disk full)
        let job = engine.recording().unwrap().id;
        engine
            .worker_tx
            .send(WorkerEvent::RecordingFinalized {
                job,
                result: Err(TrackError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "No space left on device",
                ))),
            })
            .unwrap();

        wait_for(&mut engine, Notification::Error(ErrorKind::IoFailure));
        assert_eq!(engine.state(), SessionState::Ready);
        assert!(engine.recording().is_none());
        assert!(engine.stop_recording().is_err());

        // The audio thread stops capturing on the next tick
        tick(&mut processor, 1);
        assert!(!processor.recorder().is_capturing());
        let seen = drain_for(&mut engine, Duration::from_millis(50));
        assert!(!seen.contains(&Notification::RecordFinished));
        assert!(!temp.exists());
        assert!(!dest.exists());

        // The engine records again after the failure
        let retry = dir.path().join("retry");
        engine.start_recording(dir.path().join("temp2"), &retry).unwrap();
        tick(&mut processor, 2);
        engine.stop_recording().unwrap();
        tick(&mut processor, 1);
        wait_for(&mut engine, Notification::RecordFinished);
        assert_eq!(wav_frames(&retry), 2 * BUFFER);
    }

    #[test]
    fn test_device_loss_blocks_commands_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _old_processor) = engine();
        engine.init(2, 0, true, 0).unwrap();
        assert_eq!(engine.poll_notification(), Some(Notification::PlayersPrepared));

        engine.report_device_lost("device unplugged");
        engine.report_device_lost("device unplugged");
        // Further stream errors are not reported again
        engine
            .worker_tx
            .send(WorkerEvent::DeviceLost("stream closed".to_string()))
            .unwrap();
        assert_eq!(
            engine.poll_notification(),
            Some(Notification::Error(ErrorKind::DeviceFailure))
        );
        assert_eq!(engine.poll_notification(), None);

        let err = engine.init(2, 0, true, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFailure);
        assert!(engine
            .start_recording(dir.path().join("temp"), dir.path().join("beat"))
            .is_err());

        engine.reset().unwrap();
        assert_eq!(engine.state(), SessionState::Idle);
        let mut processor = engine.take_processor().unwrap();
        assert_eq!(engine.poll_notification(), None);

        let beat = dir.path().join("beat");
        engine.init(2, 0, true, 0).unwrap();
        engine.start_recording(dir.path().join("temp"), &beat).unwrap();
        tick(&mut processor, 4);
        engine.stop_recording().unwrap();
        tick(&mut processor, 1);
        wait_for(&mut engine, Notification::RecordFinished);
        assert_eq!(wav_frames(&beat), 4 * BUFFER);
    }

    #[test]
    fn test_track_at_other_rate_is_resampled() {
        let dir = tempfile::tempdir().unwrap();
        let beat = dir.path().join("beat.wav");
        write_wav_at(&beat, 500, 4000);
        let (mut engine, _processor) = engine();

        engine.init(2, 1, true, 0).unwrap();
        engine.prepare_player(&beat, 0, 0).unwrap();
        wait_for(&mut engine, Notification::PlayersPrepared);

        let track = engine.track(0).unwrap();
        assert_eq!(track.sample_rate(), 8000);
        assert_eq!(track.frames(), 1000);
    }

    struct OverdubListener {
        temp: PathBuf,
        dest: PathBuf,
        finished: bool,
    }

    impl EngineListener for OverdubListener {
        fn on_players_prepared(&mut self, engine: &mut SessionEngine) {
            engine.start_recording(&self.temp, &self.dest).unwrap();
        }

        fn on_record_finished(&mut self, _engine: &mut SessionEngine) {
            self.finished = true;
        }
    }

    #[test]
    fn test_listener_can_drive_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let beat = fixture(&dir, "beat.wav", 2 * BUFFER as usize);
        let (mut engine, mut processor) = engine();
        let mut listener = OverdubListener {
            temp: dir.path().join("temp"),
            dest: dir.path().join("voice1"),
            finished: false,
        };

        engine.init(2, 1, true, 0).unwrap();
        engine.prepare_player(&beat, 0, 0).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while engine.state() != SessionState::Recording && Instant::now() < deadline {
            engine.dispatch_notifications(&mut listener);
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(engine.state(), SessionState::Recording);

        tick(&mut processor, 4);
        engine.stop_recording().unwrap();
        tick(&mut processor, 1);
        while !listener.finished && Instant::now() < deadline {
            engine.dispatch_notifications(&mut listener);
            thread::sleep(Duration::from_millis(2));
        }
        assert!(listener.finished);
        assert_eq!(wav_frames(&listener.dest), 4 * BUFFER);
    }
}
