//! Real-time half of the recorder
//!
//! While a capture is active, every tick converts the device input to the
//! session channel count and pushes it into the capture ring. A tick that does
//! not fit is cut at a frame boundary and the missing frames are reported as a
//! [`CaptureGap`] on a second ring, so the writer thread can fill them with
//! silence at the exact file position they were lost. The file length always
//! equals ticks x buffer size, and samples after a gap keep their alignment.

use ringbuf::traits::{Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::queue::RtEvent;

/// Gap markers the writer can fall behind by
const GAP_CAPACITY: usize = 1024;

/// Frames the audio thread could not hand to the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureGap {
    /// File frame the gap starts at
    pub at: u64,
    pub frames: u64,
}

/// Audio-thread end of a capture ring
pub struct CaptureSink {
    pub(super) samples: HeapProd<f32>,
    pub(super) gaps: HeapProd<CaptureGap>,
}

/// Writer-thread end of a capture ring
pub struct CaptureSource {
    pub(super) samples: HeapCons<f32>,
    pub(super) gaps: HeapCons<CaptureGap>,
}

/// Create a capture ring holding `capacity` samples
pub fn capture_ring(capacity: usize) -> (CaptureSink, CaptureSource) {
    let (samples, sample_cons) = HeapRb::<f32>::new(capacity).split();
    let (gaps, gap_cons) = HeapRb::<CaptureGap>::new(GAP_CAPACITY).split();
    (
        CaptureSink { samples, gaps },
        CaptureSource {
            samples: sample_cons,
            gaps: gap_cons,
        },
    )
}

struct Capture {
    job: u64,
    sink: CaptureSink,
    frames: u64,
    overruns: u64,
    /// Transport position of the first captured frame
    start_tick: Option<u64>,
}

pub struct Recorder {
    capture: Option<Capture>,
    /// Session channel count written to the file
    channels: usize,
    /// Conversion buffer, preallocated for the largest tick
    scratch: Vec<f32>,
}

impl Recorder {
    pub fn new(max_frames: usize) -> Self {
        Self {
            capture: None,
            channels: 2,
            scratch: vec![0.0; max_frames * 2],
        }
    }

    pub fn set_channels(&mut self, channels: u16) {
        self.channels = (channels as usize).clamp(1, 2);
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn frames_written(&self) -> u64 {
        self.capture.as_ref().map_or(0, |c| c.frames)
    }

    /// Transport position the current capture started at
    pub fn start_tick(&self) -> Option<u64> {
        self.capture.as_ref().and_then(|c| c.start_tick)
    }

    /// Begin a capture. A capture already running is stopped first and
    /// returned as an event.
    pub fn start(&mut self, job: u64, sink: CaptureSink) -> Option<RtEvent> {
        let previous = self.stop();
        self.capture = Some(Capture {
            job,
            sink,
            frames: 0,
            overruns: 0,
            start_tick: None,
        });
        previous
    }

    /// End the capture, handing its sink back for the control thread
    pub fn stop(&mut self) -> Option<RtEvent> {
        self.capture.take().map(|c| RtEvent::CaptureStopped {
            job: c.job,
            frames: c.frames,
            overruns: c.overruns,
            sink: c.sink,
        })
    }

    /// Capture one tick of device input (`input_channels` wide, `frames` long)
    pub fn process(&mut self, input: &[f32], input_channels: usize, frames: usize, tick: u64) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        capture.start_tick.get_or_insert(tick);

        let channels = self.channels;
        let frames = frames.min(self.scratch.len() / channels);
        let out = &mut self.scratch[..frames * channels];

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            let base = i * input_channels;
            // Missing input reads as silence
            let left = input.get(base).copied().unwrap_or(0.0);
            let right = if input_channels > 1 {
                input.get(base + 1).copied().unwrap_or(0.0)
            } else {
                left
            };
            match channels {
                1 => frame[0] = if input_channels > 1 { (left + right) * 0.5 } else { left },
                _ => {
                    frame[0] = left;
                    frame[1] = right;
                }
            }
        }

        // Whole frames only, so the ring never holds half a frame
        let fit = (capture.sink.samples.vacant_len() / channels * channels).min(out.len());
        let pushed = capture.sink.samples.push_slice(&out[..fit]) / channels;
        let lost = frames - pushed;
        if lost > 0 {
            capture.overruns += lost as u64;
            // With the gap ring full too the writer pads at the end instead
            let _ = capture.sink.gaps.try_push(CaptureGap {
                at: capture.frames + pushed as u64,
                frames: lost as u64,
            });
        }
        capture.frames += frames as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::Consumer;

    #[test]
    fn test_capture_counts_frames() {
        let (sink, mut source) = capture_ring(64);
        let mut recorder = Recorder::new(8);
        recorder.set_channels(2);
        assert!(recorder.start(7, sink).is_none());

        let input = [0.5f32; 16];
        recorder.process(&input, 2, 8, 1024);
        recorder.process(&input, 2, 8, 1032);
        assert_eq!(recorder.frames_written(), 16);
        assert_eq!(recorder.start_tick(), Some(1024));

        let mut out = [0.0f32; 64];
        assert_eq!(source.samples.pop_slice(&mut out), 32);

        match recorder.stop() {
            Some(RtEvent::CaptureStopped { job, frames, overruns, .. }) => {
                assert_eq!(job, 7);
                assert_eq!(frames, 16);
                assert_eq!(overruns, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!recorder.is_capturing());
        assert!(source.gaps.try_pop().is_none());
    }

    #[test]
    fn test_stereo_to_mono() {
        let (sink, mut source) = capture_ring(16);
        let mut recorder = Recorder::new(4);
        recorder.set_channels(1);
        recorder.start(1, sink);

        recorder.process(&[1.0, 0.0, 0.5, 0.5], 2, 2, 0);
        let mut out = [0.0f32; 4];
        assert_eq!(source.samples.pop_slice(&mut out), 2);
        assert_eq!(&out[..2], &[0.5, 0.5]);
    }

    #[test]
    fn test_mono_to_stereo() {
        let (sink, mut source) = capture_ring(16);
        let mut recorder = Recorder::new(4);
        recorder.set_channels(2);
        recorder.start(1, sink);

        recorder.process(&[0.25, -0.25], 1, 2, 0);
        let mut out = [0.0f32; 4];
        assert_eq!(source.samples.pop_slice(&mut out), 4);
        assert_eq!(out, [0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn test_overrun_still_counts_frames() {
        let (sink, _source) = capture_ring(4);
        let mut recorder = Recorder::new(8);
        recorder.set_channels(1);
        recorder.start(1, sink);

        recorder.process(&[0.1; 8], 1, 8, 0);
        match recorder.stop() {
            Some(RtEvent::CaptureStopped { frames, overruns, .. }) => {
                assert_eq!(frames, 8);
                assert_eq!(overruns, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_overrun_records_gap_position() {
        // Room for 3 stereo frames plus one odd sample
        let (sink, mut source) = capture_ring(7);
        let mut recorder = Recorder::new(4);
        recorder.set_channels(2);
        recorder.start(1, sink);

        recorder.process(&[0.5; 4], 2, 2, 0);
        recorder.process(&[0.5; 8], 2, 4, 2);

        // The odd sample slot stays empty; frames 3..6 are lost
        assert_eq!(source.samples.occupied_len(), 6);
        assert_eq!(
            source.gaps.try_pop(),
            Some(CaptureGap { at: 3, frames: 3 })
        );
        assert!(source.gaps.try_pop().is_none());
        assert_eq!(recorder.frames_written(), 6);
    }
}
