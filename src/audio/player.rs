//! Player bank
//!
//! A fixed arena of [`PlayerSlot`]s addressed by index. Each tick every
//! playing slot adds its next frames into the shared output buffer. Slots are
//! preallocated for [`MAX_PLAYER_SLOTS`], so configuring a session never
//! allocates on the audio thread.
//!
//! With loop playback the master slot's wrap is authoritative: when it returns
//! to frame 0, every other playing slot is rewound on that same frame so the
//! tracks stay locked together for the whole session.

use basedrop::Shared;

use super::queue::{EventSender, RtEvent};
use super::track::Track;
use crate::config::MAX_PLAYER_SLOTS;

/// One playback slot
#[derive(Default)]
pub struct PlayerSlot {
    track: Option<Shared<Track>>,
    position: usize,
    playing: bool,
}

impl PlayerSlot {
    pub fn is_bound(&self) -> bool {
        self.track.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Read position in frames
    pub fn position(&self) -> usize {
        self.position
    }

    fn len(&self) -> usize {
        self.track.as_ref().map_or(0, |t| t.frames())
    }

    /// Frames left before the end of the track
    fn remaining(&self) -> usize {
        self.len().saturating_sub(self.position)
    }
}

/// Outcome of mixing one slot over a span of frames
struct SpanResult {
    /// Number of times the slot hit its end
    ended: usize,
}

pub struct PlayerBank {
    slots: Vec<PlayerSlot>,
    active: usize,
    loop_playback: bool,
    master: Option<usize>,
    generation: u64,
}

impl Default for PlayerBank {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerBank {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_PLAYER_SLOTS).map(|_| PlayerSlot::default()).collect(),
            active: 0,
            loop_playback: false,
            master: None,
            generation: 0,
        }
    }

    /// Replace the layout and unbind every slot
    pub fn configure(&mut self, generation: u64, slots: usize, loop_playback: bool, master: Option<usize>) {
        self.clear();
        self.active = slots.min(MAX_PLAYER_SLOTS);
        self.loop_playback = loop_playback;
        self.master = master.filter(|&m| m < self.active);
        self.generation = generation;
    }

    /// Unbind every slot. Dropped tracks are reclaimed by the collector, not here.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.track = None;
            slot.position = 0;
            slot.playing = false;
        }
        self.active = 0;
        self.master = None;
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn bind(&mut self, index: usize, track: Shared<Track>) {
        if let Some(slot) = self.slots[..self.active].get_mut(index) {
            slot.track = Some(track);
            slot.position = 0;
            slot.playing = false;
        }
    }

    pub fn slot(&self, index: usize) -> Option<&PlayerSlot> {
        self.slots[..self.active].get(index)
    }

    /// Play or pause every bound slot, keeping positions
    pub fn set_playing(&mut self, playing: bool) {
        for slot in &mut self.slots[..self.active] {
            slot.playing = playing && slot.is_bound();
        }
    }

    pub fn rewind(&mut self) {
        for slot in &mut self.slots[..self.active] {
            slot.position = 0;
        }
    }

    pub fn any_playing(&self) -> bool {
        self.slots[..self.active].iter().any(|s| s.playing)
    }

    /// Mix every playing slot into `output` (interleaved, `channels` wide).
    ///
    /// `output` must already be silent. The sum is clamped to [-1, 1].
    pub fn process(&mut self, output: &mut [f32], channels: usize, events: &mut EventSender) {
        let frames = output.len() / channels;
        let mut offset = 0;

        while offset < frames {
            let mut span = frames - offset;

            // Split the tick at the master's wrap point so the others can be
            // rewound on exactly that frame
            let master = self.looping_master();
            if let Some(m) = master {
                span = span.min(self.slots[m].remaining());
            }

            let mut master_wrapped = false;
            for index in 0..self.active {
                if !self.slots[index].playing {
                    continue;
                }
                let result = self.mix_span(index, output, channels, offset, span);
                for _ in 0..result.ended {
                    events.post_or_drop(RtEvent::PlayerEnded {
                        generation: self.generation,
                        slot: index,
                    });
                }
                if Some(index) == master && result.ended > 0 {
                    master_wrapped = true;
                }
            }

            if master_wrapped {
                for (index, slot) in self.slots[..self.active].iter_mut().enumerate() {
                    if Some(index) != master && slot.playing {
                        slot.position = 0;
                    }
                }
            }

            offset += span;
        }

        for sample in output.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }

    /// Master slot index when its wrap should realign the bank
    fn looping_master(&self) -> Option<usize> {
        let m = self.master?;
        let slot = &self.slots[m];
        (self.loop_playback && slot.playing && slot.len() > 0).then_some(m)
    }

    /// Add `span` frames of one slot at frame `offset` of `output`
    fn mix_span(
        &mut self,
        index: usize,
        output: &mut [f32],
        channels: usize,
        offset: usize,
        span: usize,
    ) -> SpanResult {
        let loop_playback = self.loop_playback;
        let slot = &mut self.slots[index];
        let mut result = SpanResult { ended: 0 };

        let Some(track) = slot.track.as_ref() else {
            slot.playing = false;
            return result;
        };
        let len = track.frames();

        if len == 0 {
            // Nothing to play; report the end once instead of wrapping forever
            slot.playing = false;
            result.ended = 1;
            return result;
        }

        let mut done = 0;
        while done < span {
            let n = (len - slot.position).min(span - done);
            let start = (offset + done) * channels;
            for (i, frame) in output[start..start + n * channels]
                .chunks_exact_mut(channels)
                .enumerate()
            {
                let src = slot.position + i;
                for (ch, sample) in frame.iter_mut().enumerate() {
                    *sample += track.sample(src, ch, channels);
                }
            }
            slot.position += n;
            done += n;

            if slot.position >= len {
                result.ended += 1;
                if loop_playback {
                    slot.position = 0;
                } else {
                    // Rest of the span stays zero-padded
                    slot.playing = false;
                    break;
                }
            }
        }

        result
    }
}
