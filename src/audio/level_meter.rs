//! Capture loudness meter for UI feedback.
//!
//! The capture thread is the only writer; any number of UI readers take
//! snapshots. The level is stored as `f32` bits in an `AtomicU32` so readers
//! never observe a torn value.

use std::sync::atomic::{AtomicU32, Ordering};

/// Gain applied to the normalized RMS so normal speech fills the bar.
const DISPLAY_GAIN: f32 = 5.0;
/// Weight of the previous level in the exponential smoothing.
const SMOOTHING: f32 = 0.7;
/// Levels below this snap to silence.
const SILENCE_FLOOR: f32 = 1e-6;

const FULL_SCALE: f32 = 32768.0;

#[derive(Debug, Default)]
pub struct CaptureLevelMeter {
    level: AtomicU32,
}

impl CaptureLevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one block of raw samples into the smoothed level and return it.
    ///
    /// An empty block counts as silence.
    pub fn update(&self, samples: &[i16]) -> f32 {
        let scaled = (block_rms(samples) * DISPLAY_GAIN).min(1.0);

        let old = self.level();
        let mut new = (old * SMOOTHING + scaled * (1.0 - SMOOTHING)).clamp(0.0, 1.0);
        if new < SILENCE_FLOOR {
            new = 0.0;
        }

        self.level.store(new.to_bits(), Ordering::Release);
        new
    }

    /// Latest published level in [0, 1].
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Acquire))
    }
}

/// Root-mean-square of a block, normalized to full scale.
fn block_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / FULL_SCALE as f64;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_silent() {
        let meter = CaptureLevelMeter::new();
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_smoothing_formula() {
        let meter = CaptureLevelMeter::new();
        // Constant amplitude 3277 -> rms ~0.1, scaled ~0.5.
        let block = vec![3277i16; 960];
        let scaled = (3277.0f32 / 32768.0) * DISPLAY_GAIN;

        let first = meter.update(&block);
        assert!((first - scaled * 0.3).abs() < 1e-4);

        let second = meter.update(&block);
        assert!((second - (first * 0.7 + scaled * 0.3)).abs() < 1e-4);
        assert_eq!(meter.level(), second);
    }

    #[test]
    fn test_silence_decays_strictly() {
        let meter = CaptureLevelMeter::new();
        meter.update(&vec![i16::MAX; 480]);

        let silence = vec![0i16; 480];
        let mut previous = meter.level();
        while previous > 0.0 {
            let next = meter.update(&silence);
            assert!(next < previous, "{} should be below {}", next, previous);
            previous = next;
        }
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_full_scale_never_exceeds_one() {
        let meter = CaptureLevelMeter::new();
        let block = vec![i16::MIN; 960];
        let mut level = 0.0;
        for _ in 0..200 {
            level = meter.update(&block);
            assert!(level <= 1.0);
        }
        assert!(level > 0.99);
    }

    #[test]
    fn test_empty_block_counts_as_silence() {
        let meter = CaptureLevelMeter::new();
        meter.update(&vec![8000i16; 960]);
        let before = meter.level();

        let after = meter.update(&[]);
        assert!(after.is_finite());
        assert!((after - before * 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_deterministic_for_same_input() {
        let blocks: Vec<Vec<i16>> = (0..10)
            .map(|i| (0..320).map(|j| ((i * 997 + j * 31) % 20000) as i16).collect())
            .collect();

        let a = CaptureLevelMeter::new();
        let b = CaptureLevelMeter::new();
        for block in &blocks {
            assert_eq!(a.update(block).to_bits(), b.update(block).to_bits());
        }
    }
}
