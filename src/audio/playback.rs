//! Playback: per-participant mixing and the ALSA output thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{Result, bail};
use parking_lot::Mutex;

use super::alsa_device;
use super::reblock::upmix;
use super::voice_codec::{FRAME_SIZE, SAMPLE_RATE};

/// Decoded audio buffered per slot before the oldest samples are dropped.
pub const MAX_QUEUED_FRAMES: usize = 20;

const MAX_RECOVERY_RETRIES: u32 = 3;

/// Playback stream settings.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Desired ALSA period size (0 = let ALSA decide)
    pub period_size: usize,
    pub master_gain: f32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            device: alsa_device::DEFAULT_DEVICE.to_string(),
            sample_rate: SAMPLE_RATE,
            channels: 2,
            period_size: FRAME_SIZE,
            master_gain: 1.0,
        }
    }
}

// ======================== Mixer ========================

/// Sums decoded voice from every participant into one mono stream.
///
/// The master gain scales the mixed output only; capture is never affected.
pub struct PlaybackMixer {
    queues: Box<[Mutex<VecDeque<i16>>]>,
    /// Sum buffer reused across periods.
    scratch: Mutex<Vec<i32>>,
    master_gain: AtomicU32,
}

impl PlaybackMixer {
    pub fn new(slots: usize) -> Self {
        Self {
            queues: (0..slots).map(|_| Mutex::new(VecDeque::new())).collect(),
            scratch: Mutex::new(Vec::with_capacity(FRAME_SIZE)),
            master_gain: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    /// Queue decoded PCM for `slot`. Unknown slots are ignored.
    pub fn submit(&self, slot: usize, pcm: &[i16]) {
        let Some(queue) = self.queues.get(slot) else {
            return;
        };
        let mut queue = queue.lock();
        queue.extend(pcm.iter().copied());

        let cap = MAX_QUEUED_FRAMES * FRAME_SIZE;
        if queue.len() > cap {
            let excess = queue.len() - cap;
            queue.drain(..excess);
            log::debug!("Playback queue for slot {} overflowed, dropped {} samples", slot, excess);
        }
    }

    /// Drop everything queued for `slot`.
    pub fn clear(&self, slot: usize) {
        if let Some(queue) = self.queues.get(slot) {
            queue.lock().clear();
        }
    }

    pub fn queued(&self, slot: usize) -> usize {
        self.queues.get(slot).map_or(0, |queue| queue.lock().len())
    }

    /// Fill `out` with the mix of every slot. Missing data plays as silence.
    pub fn mix(&self, out: &mut [i16]) {
        let mut acc = self.scratch.lock();
        acc.clear();
        acc.resize(out.len(), 0);
        for queue in self.queues.iter() {
            let mut queue = queue.lock();
            let n = queue.len().min(out.len());
            for (sum, sample) in acc.iter_mut().zip(queue.drain(..n)) {
                *sum += sample as i32;
            }
        }

        let gain = self.master_gain();
        for (dst, &sum) in out.iter_mut().zip(acc.iter()) {
            let scaled = (sum as f32 * gain).round();
            *dst = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    pub fn set_master_gain(&self, gain: f32) {
        let gain = if gain.is_finite() { gain.max(0.0) } else { 1.0 };
        self.master_gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn master_gain(&self) -> f32 {
        f32::from_bits(self.master_gain.load(Ordering::Relaxed))
    }
}

// ======================== Playback thread ========================

pub fn playback_thread(
    settings: &PlaybackSettings,
    mixer: &PlaybackMixer,
    running: &AtomicBool,
) -> Result<()> {
    let period_size_opt = if settings.period_size > 0 {
        Some(settings.period_size)
    } else {
        None
    };
    let (pcm, params) = alsa_device::open_playback(
        &settings.device,
        settings.sample_rate,
        settings.channels,
        period_size_opt,
    )?;

    if params.sample_rate != SAMPLE_RATE {
        bail!(
            "Playback device negotiated {}Hz, voice playback needs {}Hz",
            params.sample_rate,
            SAMPLE_RATE
        );
    }

    let actual_channels = params.channels as usize;
    let io = pcm.io_i16()?;

    let mut mono = vec![0i16; params.period_size];
    let mut interleaved = Vec::with_capacity(params.period_size * actual_channels);

    log::info!(
        "Playback started: device={}, rate={}, ch={}, period={}",
        params.device,
        params.sample_rate,
        actual_channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        mixer.mix(&mut mono);
        upmix(&mono, actual_channels, &mut interleaved);

        // Short writes and XRUNs are retried without losing frames.
        let total_frames = mono.len();
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        while frames_written < total_frames {
            let offset = frames_written * actual_channels;
            match io.writei(&interleaved[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;

                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        return Err(e2.into());
                    }

                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    let _ = pcm.drain();
    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_sums_slots() {
        let mixer = PlaybackMixer::new(4);
        mixer.submit(0, &[100, 200, 300]);
        mixer.submit(3, &[10, 20]);

        let mut out = [0i16; 4];
        mixer.mix(&mut out);
        assert_eq!(out, [110, 220, 300, 0]);
        assert_eq!(mixer.queued(0), 0);
        assert_eq!(mixer.queued(3), 0);
    }

    #[test]
    fn test_mix_consumes_only_one_period() {
        let mixer = PlaybackMixer::new(1);
        mixer.submit(0, &[1, 2, 3, 4, 5]);

        let mut out = [0i16; 2];
        mixer.mix(&mut out);
        assert_eq!(out, [1, 2]);
        assert_eq!(mixer.queued(0), 3);
    }

    #[test]
    fn test_mix_saturates() {
        let mixer = PlaybackMixer::new(2);
        mixer.submit(0, &[30000, -30000]);
        mixer.submit(1, &[30000, -30000]);

        let mut out = [0i16; 2];
        mixer.mix(&mut out);
        assert_eq!(out, [i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_master_gain_scales_playback() {
        let mixer = PlaybackMixer::new(1);
        assert_eq!(mixer.master_gain(), 1.0);

        mixer.set_master_gain(0.5);
        mixer.submit(0, &[1000, -1000]);
        let mut out = [0i16; 2];
        mixer.mix(&mut out);
        assert_eq!(out, [500, -500]);

        mixer.set_master_gain(f32::NAN);
        assert_eq!(mixer.master_gain(), 1.0);
        mixer.set_master_gain(-2.0);
        assert_eq!(mixer.master_gain(), 0.0);
    }

    #[test]
    fn test_queue_is_capped() {
        let mixer = PlaybackMixer::new(1);
        let frame: Vec<i16> = (0..FRAME_SIZE as i16).collect();
        for _ in 0..MAX_QUEUED_FRAMES + 5 {
            mixer.submit(0, &frame);
        }
        assert_eq!(mixer.queued(0), MAX_QUEUED_FRAMES * FRAME_SIZE);

        // Oldest data went first, so the queue still starts on a frame boundary.
        let mut out = [0i16; 3];
        mixer.mix(&mut out);
        assert_eq!(out, [0, 1, 2]);
    }

    #[test]
    fn test_unknown_slot_is_ignored() {
        let mixer = PlaybackMixer::new(2);
        mixer.submit(5, &[1, 2, 3]);
        assert_eq!(mixer.queued(5), 0);

        mixer.submit(1, &[1, 2, 3]);
        mixer.clear(1);
        assert_eq!(mixer.queued(1), 0);
    }

    #[test]
    fn test_mix_reuses_sum_buffer() {
        let mixer = PlaybackMixer::new(1);
        let mut out = vec![0i16; FRAME_SIZE];
        mixer.submit(0, &[1000i16; FRAME_SIZE]);
        mixer.mix(&mut out);
        let capacity = mixer.scratch.lock().capacity();

        // Earlier sums must not leak into the next period.
        mixer.mix(&mut out);
        assert!(out.iter().all(|&s| s == 0));

        // Shorter period after a longer one.
        mixer.submit(0, &[7, 8]);
        let mut short = [0i16; 2];
        mixer.mix(&mut short);
        assert_eq!(short, [7, 8]);
        assert_eq!(mixer.scratch.lock().capacity(), capacity);
    }
}
