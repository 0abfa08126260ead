//! Track storage
//!
//! This module handles both directions of the engine's file contract:
//! - decoding a track fully into memory with symphonia
//! - writing captured samples to a temp WAV on a writer thread and promoting
//!   it to the destination path once the recording is complete
//!
//! The writer thread is the only place file I/O happens during a recording;
//! the real-time side only pushes samples into a ring buffer.

use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use ringbuf::traits::{Consumer, Observer};
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use super::recorder::CaptureSource;

/// Input frames per resampler chunk
const RESAMPLE_CHUNK: usize = 1024;

/// Errors that can occur while reading or writing tracks
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to probe audio format: {0}")]
    Probe(String),

    #[error("No audio tracks found")]
    NoTracks,

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Resampler error: {0}")]
    Resample(String),
}

/// A fully decoded track, interleaved `f32` at its native channel count (1 or 2)
#[derive(Debug, Clone)]
pub struct Track {
    source: PathBuf,
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
}

impl Track {
    pub fn from_samples(
        source: impl Into<PathBuf>,
        samples: Vec<f32>,
        channels: usize,
        sample_rate: u32,
    ) -> Self {
        let channels = channels.clamp(1, 2);
        let mut samples = samples;
        samples.truncate(samples.len() - samples.len() % channels);
        Self {
            source: source.into(),
            samples,
            channels,
            sample_rate,
        }
    }

    /// Decode a whole file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrackError> {
        Self::load_range(path, 0, 0)
    }

    /// Decode the container stored at `offset..offset + length` bytes of `path`.
    ///
    /// `length == 0` reads to the end of the file.
    pub fn load_range(path: impl AsRef<Path>, offset: u64, length: u64) -> Result<Self, TrackError> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let source: Box<dyn MediaSource> = if offset == 0 && length == 0 {
            Box::new(file)
        } else {
            file.seek(SeekFrom::Start(offset))?;
            let mut bytes = Vec::new();
            if length == 0 {
                file.read_to_end(&mut bytes)?;
            } else {
                file.take(length).read_to_end(&mut bytes)?;
                if (bytes.len() as u64) < length {
                    return Err(TrackError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("range {}+{} past end of file", offset, length),
                    )));
                }
            }
            Box::new(Cursor::new(bytes))
        };

        let mss = MediaSourceStream::new(source, Default::default());

        // Create hint from file extension
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| TrackError::Probe(e.to_string()))?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(TrackError::NoTracks)?;

        let track_id = track.id;
        let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
        let mut channels = track
            .codec_params
            .channels
            .map(|c| c.count().min(2))
            .unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| TrackError::Decoder(e.to_string()))?;

        let mut samples = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(TrackError::Decoder(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Skipping corrupt packet in {:?}: {}", path, e);
                    continue;
                }
                Err(e) => return Err(TrackError::Decoder(e.to_string())),
            };

            let spec = *decoded.spec();
            let src_channels = spec.channels.count();
            if src_channels == 0 {
                return Err(TrackError::NoTracks);
            }
            if channels == 0 {
                channels = src_channels.min(2);
            } else if src_channels < channels {
                return Err(TrackError::Decoder(format!(
                    "channel count changed mid-stream ({} -> {})",
                    channels, src_channels
                )));
            }
            if sample_rate == 0 {
                sample_rate = spec.rate;
            }

            let needed = decoded.capacity() * src_channels;
            if sample_buf.as_ref().map_or(true, |b| b.capacity() < needed) {
                sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }
            let Some(buf) = sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            for frame in buf.samples().chunks_exact(src_channels) {
                samples.extend_from_slice(&frame[..channels]);
            }
        }

        if channels == 0 {
            return Err(TrackError::NoTracks);
        }

        log::info!(
            "Decoded {:?}: {} frames, {} ch, {} Hz",
            path,
            samples.len() / channels,
            channels,
            sample_rate
        );

        Ok(Self::from_samples(path, samples, channels, sample_rate))
    }

    /// Convert to `target_rate` with rubato's FFT resampler.
    ///
    /// The length scales with the rate ratio and the resampler delay is
    /// trimmed, so frame 0 of the result is frame 0 of the source.
    pub fn resampled(self, target_rate: u32) -> Result<Self, TrackError> {
        if self.sample_rate == target_rate || self.sample_rate == 0 || target_rate == 0 {
            return Ok(self);
        }
        let channels = self.channels;
        let frames = self.frames();
        let expected = (frames as u64 * target_rate as u64).div_ceil(self.sample_rate as u64) as usize;

        let mut resampler = FftFixedIn::<f32>::new(
            self.sample_rate as usize,
            target_rate as usize,
            RESAMPLE_CHUNK,
            2,
            channels,
        )
        .map_err(|e| TrackError::Resample(e.to_string()))?;
        let delay = resampler.output_delay();

        let planar: Vec<Vec<f32>> = (0..channels)
            .map(|ch| self.samples.iter().skip(ch).step_by(channels).copied().collect())
            .collect();
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(delay + expected); channels];
        let mut chunk: Vec<Vec<f32>> = vec![Vec::new(); channels];

        let mut pos = 0;
        // Keep feeding (zeros past the end) until the delayed tail is out
        while output[0].len() < delay + expected {
            let need = resampler.input_frames_next();
            let n = need.min(frames.saturating_sub(pos));
            for (buf, src) in chunk.iter_mut().zip(&planar) {
                buf.clear();
                buf.extend_from_slice(&src[pos..pos + n]);
                buf.resize(need, 0.0);
            }
            pos += n;

            let out = resampler
                .process(&chunk, None)
                .map_err(|e| TrackError::Resample(e.to_string()))?;
            for (dst, data) in output.iter_mut().zip(out) {
                dst.extend_from_slice(&data);
            }
        }

        let mut samples = Vec::with_capacity(expected * channels);
        for i in delay..delay + expected {
            for ch in &output {
                samples.push(ch[i]);
            }
        }
        log::info!(
            "Resampled {:?} from {} Hz to {} Hz ({} -> {} frames)",
            self.source,
            self.sample_rate,
            target_rate,
            frames,
            expected
        );

        Ok(Self {
            source: self.source,
            samples,
            channels,
            sample_rate: target_rate,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Length in frames
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample at `frame` mapped onto an output with `out_channels` channels.
    ///
    /// Mono tracks are duplicated to every output channel; stereo tracks are
    /// averaged for a mono output.
    #[inline]
    pub fn sample(&self, frame: usize, out_channel: usize, out_channels: usize) -> f32 {
        let base = frame * self.channels;
        match (self.channels, out_channels) {
            (1, _) => self.samples[base],
            (_, 1) => (self.samples[base] + self.samples[base + 1]) * 0.5,
            _ => self.samples[base + out_channel.min(1)],
        }
    }
}

/// Convert a float sample to 16-bit PCM
#[inline]
pub fn to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Move a finished temp file to its destination.
///
/// A rename is tried first. If that fails (different filesystem) the temp file
/// is copied next to the destination and renamed into place, so the
/// destination is either the complete file or untouched. The temp file is
/// removed in every case.
pub fn promote(temp: &Path, dest: &Path) -> Result<(), TrackError> {
    match fs::rename(temp, dest) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::debug!("Rename {:?} -> {:?} failed ({}), copying", temp, dest, e);
            let staging = staging_path(dest);
            let result = fs::copy(temp, &staging).and_then(|_| fs::rename(&staging, dest));
            if result.is_err() {
                let _ = fs::remove_file(&staging);
            }
            let _ = fs::remove_file(temp);
            result.map_err(TrackError::from)
        }
    }
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Flags shared between the control thread and a capture writer thread
#[derive(Default)]
struct CaptureShared {
    finish: AtomicBool,
    abandon: AtomicBool,
    expected_frames: AtomicU64,
}

/// Handle to the thread that drains captured samples into the temp WAV
pub struct CaptureWriter {
    shared: Arc<CaptureShared>,
    handle: Option<thread::JoinHandle<()>>,
    temp_path: PathBuf,
}

impl CaptureWriter {
    /// Create the temp file and start draining `source` into it.
    ///
    /// The temp file is created synchronously so an unwritable path fails
    /// here. `on_finish` runs on the writer thread with the number of frames
    /// in the promoted file, or the error that stopped it. It is not called
    /// for abandoned recordings.
    pub fn spawn<F>(
        temp_path: &Path,
        dest_path: &Path,
        channels: u16,
        sample_rate: u32,
        source: CaptureSource,
        on_finish: F,
    ) -> Result<Self, TrackError>
    where
        F: FnOnce(Result<u64, TrackError>) + Send + 'static,
    {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(temp_path, spec)?;

        let shared = Arc::new(CaptureShared::default());
        let thread_shared = Arc::clone(&shared);
        let temp = temp_path.to_path_buf();
        let dest = dest_path.to_path_buf();

        let handle = thread::Builder::new()
            .name("overdub-capture".to_string())
            .spawn(move || {
                match capture_thread(writer, source, &thread_shared, channels, &temp, &dest) {
                    Ok(Some(frames)) => on_finish(Ok(frames)),
                    Ok(None) => log::debug!("Capture to {:?} abandoned", temp),
                    Err(e) => {
                        let _ = fs::remove_file(&temp);
                        on_finish(Err(e));
                    }
                }
            })
            .map_err(|e| {
                let _ = fs::remove_file(temp_path);
                TrackError::Io(e)
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
            temp_path: temp_path.to_path_buf(),
        })
    }

    /// Tell the writer that capture stopped after `frames` frames.
    ///
    /// Frames lost to ring overruns are written as silence, at their
    /// position when the audio thread recorded one, so the file length always
    /// matches the captured tick count.
    pub fn finish(&self, frames: u64) {
        self.shared.expected_frames.store(frames, Ordering::Relaxed);
        self.shared.finish.store(true, Ordering::Release);
    }

    /// Stop without promoting and delete the temp file. Blocks until the
    /// writer thread exits.
    pub fn abandon(mut self) {
        self.shared.abandon.store(true, Ordering::Release);
        self.join_thread();
        match fs::remove_file(&self.temp_path) {
            Ok(()) => log::debug!("Removed temp file {:?}", self.temp_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove temp file {:?}: {}", self.temp_path, e),
        }
    }

    /// Wait for a finished writer thread
    pub fn join(mut self) {
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Capture writer thread panicked");
            }
        }
    }
}

/// Writer thread body. Returns `Ok(None)` when abandoned.
fn capture_thread(
    mut writer: WavWriter<std::io::BufWriter<File>>,
    mut source: CaptureSource,
    shared: &CaptureShared,
    channels: u16,
    temp: &Path,
    dest: &Path,
) -> Result<Option<u64>, TrackError> {
    let channels = channels as usize;
    let mut chunk = vec![0.0f32; 4096];
    let mut written: u64 = 0;
    let mut filled: u64 = 0;

    loop {
        if shared.abandon.load(Ordering::Acquire) {
            return Ok(None);
        }

        // Read the flag before draining: once it is set the producer is done
        let finishing = shared.finish.load(Ordering::Acquire);
        // Samples are counted before gaps are checked; a gap is always queued
        // ahead of the samples that follow it
        let mut available = source.samples.occupied_len();

        if let Some(gap) = source.gaps.try_peek().copied() {
            if gap.at <= written {
                for _ in 0..gap.frames as usize * channels {
                    writer.write_sample(0i16)?;
                }
                written += gap.frames;
                filled += gap.frames;
                source.gaps.try_pop();
                continue;
            }
            available = available.min((gap.at - written) as usize * channels);
        }

        let take = available.min(chunk.len());
        let n = source.samples.pop_slice(&mut chunk[..take]);
        for &sample in &chunk[..n] {
            writer.write_sample(to_pcm16(sample))?;
        }
        written += (n / channels) as u64;

        if n == 0 {
            if finishing && source.samples.is_empty() && source.gaps.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    if filled > 0 {
        log::warn!("Capture lost {} frames to overruns, filled with silence in place", filled);
    }
    let expected = shared.expected_frames.load(Ordering::Relaxed);
    if written < expected {
        log::warn!(
            "Capture lost {} frames with no recorded position, padding at the end; \
             alignment after the loss is off",
            expected - written
        );
        for _ in 0..(expected - written) as usize * channels {
            writer.write_sample(0i16)?;
        }
        written = expected;
    }

    writer.finalize()?;

    if shared.abandon.load(Ordering::Acquire) {
        return Ok(None);
    }

    promote(temp, dest)?;
    log::info!("Recording promoted to {:?} ({} frames)", dest, written);
    Ok(Some(written))
}
