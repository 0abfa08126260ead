//! Transport clock
//!
//! A single frame counter owned by the real-time processor. It advances once
//! per tick while anything is playing or capturing, and every stream in that
//! tick reads the same value, which is what keeps capture and playback in
//! lock-step.

#[derive(Debug, Default)]
pub struct TransportClock {
    frames: u64,
}

impl TransportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame position at the start of the current tick
    #[inline]
    pub fn position(&self) -> u64 {
        self.frames
    }

    #[inline]
    pub fn advance(&mut self, frames: usize) {
        self.frames += frames as u64;
    }

    pub fn reset(&mut self) {
        self.frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_and_reset() {
        let mut clock = TransportClock::new();
        assert_eq!(clock.position(), 0);

        clock.advance(256);
        clock.advance(256);
        assert_eq!(clock.position(), 512);

        clock.reset();
        assert_eq!(clock.position(), 0);
    }
}
