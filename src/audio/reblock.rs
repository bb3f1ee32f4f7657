//! Reblocking of capture data into native codec frames.
//!
//! The capture device hands over whatever block size it was configured with;
//! the encoder only accepts exact 960-sample mono frames.

use std::collections::VecDeque;

use super::voice_codec::FRAME_SIZE;

/// Accumulates mono samples and releases them one native frame at a time.
#[derive(Debug)]
pub struct FrameAccumulator {
    pending: VecDeque<i16>,
    frame: Vec<i16>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::with_capacity(FRAME_SIZE * 4),
            frame: vec![0; FRAME_SIZE],
        }
    }

    pub fn push(&mut self, samples: &[i16]) {
        self.pending.extend(samples.iter().copied());
    }

    /// Next complete frame, or `None` until enough samples are queued.
    /// The returned slice is valid until the next call.
    pub fn next_frame(&mut self) -> Option<&[i16]> {
        if self.pending.len() < FRAME_SIZE {
            return None;
        }
        for (dst, src) in self.frame.iter_mut().zip(self.pending.drain(..FRAME_SIZE)) {
            *dst = src;
        }
        Some(&self.frame)
    }

    /// Samples waiting for a complete frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Mix interleaved multi-channel samples down to mono by averaging.
pub fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Duplicate mono samples into every output channel.
pub fn upmix(mono: &[i16], channels: usize, out: &mut Vec<i16>) {
    out.clear();
    if channels <= 1 {
        out.extend_from_slice(mono);
        return;
    }
    out.reserve(mono.len() * channels);
    for &s in mono {
        out.extend(std::iter::repeat_n(s, channels));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_frame_until_full() {
        let mut acc = FrameAccumulator::new();
        acc.push(&vec![1; FRAME_SIZE - 1]);
        assert!(acc.next_frame().is_none());
        assert_eq!(acc.pending(), FRAME_SIZE - 1);

        acc.push(&[1]);
        assert_eq!(acc.next_frame().map(<[i16]>::len), Some(FRAME_SIZE));
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_irregular_blocks_keep_order() {
        let source: Vec<i16> = (0..(FRAME_SIZE * 3) as i32).map(|i| (i % 30000) as i16).collect();
        let mut acc = FrameAccumulator::new();
        let mut output = Vec::new();

        for block in source.chunks(337) {
            acc.push(block);
            while let Some(frame) = acc.next_frame() {
                output.extend_from_slice(frame);
            }
        }

        assert_eq!(output, source);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_leftover_is_kept() {
        let mut acc = FrameAccumulator::new();
        acc.push(&vec![7; FRAME_SIZE + 100]);
        assert!(acc.next_frame().is_some());
        assert!(acc.next_frame().is_none());
        assert_eq!(acc.pending(), 100);

        acc.clear();
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = [100i16, 300, -200, 200, i16::MAX, i16::MAX];
        assert_eq!(downmix(&stereo, 2), vec![200, 0, i16::MAX]);
        assert_eq!(downmix(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn test_upmix_duplicates() {
        let mut out = Vec::new();
        upmix(&[1, 2, 3], 2, &mut out);
        assert_eq!(out, vec![1, 1, 2, 2, 3, 3]);

        upmix(&[4], 1, &mut out);
        assert_eq!(out, vec![4]);
    }
}
