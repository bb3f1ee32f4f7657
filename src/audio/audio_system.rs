//! The VoiceSystem owns the codec engine and the capture/playback threads.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::capture::{self, CaptureSettings, OutboundPacket};
use super::level_meter::CaptureLevelMeter;
use super::playback::{self, PlaybackMixer, PlaybackSettings};
use super::voice_codec::{CodecEngine, DEFAULT_BITRATE, FRAME_SIZE, MAX_PARTICIPANTS};
use crate::voice_bridge::{InboundPacket, SequenceGap, SequenceTracker};

/// Upper bound on concealment frames synthesized for one gap.
const MAX_CONCEALED_FRAMES: u16 = 3;

/// Voice system configuration.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub capture: CaptureSettings,
    pub playback: PlaybackSettings,
    /// Encoder target bitrate in bits/s
    pub bitrate: i32,
    /// Number of remote participant slots
    pub max_participants: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            playback: PlaybackSettings::default(),
            bitrate: DEFAULT_BITRATE,
            max_participants: MAX_PARTICIPANTS,
        }
    }
}

/// Voice chat runtime.
///
/// - Capture thread: ALSA capture → level meter → reblock → encode → `outbound_tx`
/// - Network path: [`VoiceSystem::receive`] → per-slot decode → mixer
/// - Playback thread: mixer → ALSA playback
pub struct VoiceSystem {
    config: VoiceConfig,
    engine: Arc<CodecEngine>,
    meter: Arc<CaptureLevelMeter>,
    mixer: Arc<PlaybackMixer>,
    sequences: Mutex<SequenceTracker>,
    running: Arc<AtomicBool>,
    transmit: Arc<AtomicBool>,
    capture_handle: Option<JoinHandle<()>>,
    play_handle: Option<JoinHandle<()>>,
}

impl VoiceSystem {
    /// Initialize the codec engine. Voice chat stays disabled if this fails.
    pub fn new(config: VoiceConfig) -> Result<Self> {
        let engine = Arc::new(CodecEngine::new(config.max_participants));
        engine.init().context("Voice codec initialization failed")?;
        if config.bitrate != DEFAULT_BITRATE {
            engine.set_bitrate(config.bitrate);
        }

        let mixer = Arc::new(PlaybackMixer::new(config.max_participants));
        mixer.set_master_gain(config.playback.master_gain);

        Ok(Self {
            sequences: Mutex::new(SequenceTracker::new(config.max_participants)),
            config,
            engine,
            meter: Arc::new(CaptureLevelMeter::new()),
            mixer,
            running: Arc::new(AtomicBool::new(false)),
            transmit: Arc::new(AtomicBool::new(false)),
            capture_handle: None,
            play_handle: None,
        })
    }

    /// Start the playback thread and, if enabled, the capture thread.
    pub fn start(&mut self, outbound_tx: mpsc::Sender<OutboundPacket>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        log::info!(
            "VoiceSystem starting: capture: \"{}\" ({}), playback: \"{}\", rate: {}Hz, bitrate: {}",
            self.config.capture.device,
            if self.config.capture.enabled { "enabled" } else { "disabled" },
            self.config.playback.device,
            self.config.capture.sample_rate,
            self.config.bitrate,
        );

        self.play_handle = Some({
            let running = self.running.clone();
            let mixer = self.mixer.clone();
            let settings = self.config.playback.clone();
            thread::Builder::new()
                .name("voice-play".into())
                .spawn(move || {
                    if let Err(e) = playback::playback_thread(&settings, &mixer, &running) {
                        log::error!("Playback thread error: {:#}", e);
                    }
                })?
        });

        if !self.config.capture.enabled {
            log::info!("Audio capture disabled by configuration");
            return Ok(());
        }

        self.capture_handle = Some({
            let running = self.running.clone();
            let transmit = self.transmit.clone();
            let engine = self.engine.clone();
            let meter = self.meter.clone();
            let settings = self.config.capture.clone();
            thread::Builder::new()
                .name("voice-capture".into())
                .spawn(move || {
                    if let Err(e) = capture::capture_thread(
                        &settings,
                        engine,
                        meter,
                        outbound_tx,
                        &running,
                        &transmit,
                    ) {
                        log::error!("Capture thread error: {:#}", e);
                    }
                })?
        });

        Ok(())
    }

    /// Begin transmitting microphone audio. The first packet sent afterwards
    /// is flagged as the start of a new talk burst.
    pub fn start_capture(&self) {
        if !self.transmit.swap(true, Ordering::SeqCst) {
            log::info!("Voice capture started");
        }
    }

    /// Stop transmitting. The microphone keeps running for the level meter.
    pub fn stop_capture(&self) {
        if self.transmit.swap(false, Ordering::SeqCst) {
            log::info!("Voice capture stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.transmit.load(Ordering::SeqCst)
    }

    /// Decode one inbound packet into the playback mixer.
    ///
    /// A discontinuity resets the sender's decoder and drops audio still
    /// queued from its previous burst. A single missing packet is
    /// rebuilt from the FEC data of this one; longer gaps are concealed.
    /// Codec failures leave a gap of silence.
    pub fn receive(&self, packet: &InboundPacket) {
        let slot = packet.slot;
        if slot >= self.engine.max_slots() {
            return;
        }

        let gap = {
            let mut sequences = self.sequences.lock();
            if packet.discontinuity {
                sequences.reset(slot);
            }
            sequences.observe(slot, packet.sequence)
        };
        if packet.discontinuity {
            self.engine.reset_decoder(slot);
            self.mixer.clear(slot);
        }

        let mut pcm = [0i16; FRAME_SIZE];
        if let SequenceGap::Lost(missing) = gap {
            for _ in 1..missing.min(MAX_CONCEALED_FRAMES) {
                if let Ok(n) = self.engine.decode_lost(slot, &mut pcm) {
                    self.mixer.submit(slot, &pcm[..n]);
                }
            }
            if let Ok(n) = self.engine.decode(slot, &packet.payload, &mut pcm, true) {
                self.mixer.submit(slot, &pcm[..n]);
            }
        }

        if let Ok(n) = self.engine.decode(slot, &packet.payload, &mut pcm, false) {
            self.mixer.submit(slot, &pcm[..n]);
        }
    }

    /// Smoothed microphone level in [0, 1] for UI display.
    pub fn capture_level(&self) -> f32 {
        self.meter.level()
    }

    pub fn set_bitrate(&self, bits_per_second: i32) {
        self.engine.set_bitrate(bits_per_second);
    }

    pub fn set_master_gain(&self, gain: f32) {
        self.mixer.set_master_gain(gain);
    }

    /// Clear codec state after a long silence.
    pub fn reset(&self) {
        self.engine.reset();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the audio threads, then release the codec.
    pub fn stop(&mut self) {
        self.transmit.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.capture_handle.take() {
            let _ = h.join();
        }
        if let Some(h) = self.play_handle.take() {
            let _ = h.join();
        }
        self.engine.shutdown();
    }
}

impl Drop for VoiceSystem {
    fn drop(&mut self) {
        self.stop();
    }
}
