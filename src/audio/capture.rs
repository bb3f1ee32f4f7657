//! Microphone capture: ALSA device, level metering and frame encoding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use alsa::pcm::PCM;
use anyhow::{Result, bail};
use bytes::Bytes;
use tokio::sync::mpsc;

use super::alsa_device::{self, AlsaParams};
use super::level_meter::CaptureLevelMeter;
use super::reblock::{FrameAccumulator, downmix};
use super::voice_codec::{CodecEngine, CodecError, FRAME_SIZE, MAX_PACKET_SIZE, SAMPLE_RATE};

/// Capture block size used when the configured size is 0.
pub const DEFAULT_BLOCK_SIZE: usize = FRAME_SIZE * 4;

/// Capture stream settings.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Open the microphone at all
    pub enabled: bool,
    /// ALSA device name, empty for the default device
    pub device: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames per read (0 = [`DEFAULT_BLOCK_SIZE`])
    pub block_size: usize,
}

impl CaptureSettings {
    pub fn effective_block_size(&self) -> usize {
        if self.block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            self.block_size
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            device: String::new(),
            sample_rate: SAMPLE_RATE,
            channels: 1,
            block_size: 0,
        }
    }
}

/// One encoded frame on its way to the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub payload: Bytes,
    /// First packet of a talk burst; receivers reset their decoder.
    pub new_burst: bool,
}

// ======================== Capture device ========================

pub struct CaptureDevice {
    pcm: Option<PCM>,
    params: AlsaParams,
    read_buf: Vec<i16>,
}

impl CaptureDevice {
    pub fn open(settings: &CaptureSettings) -> Result<Self> {
        if !settings.enabled {
            bail!("audio capture disabled by configuration");
        }

        let (pcm, params) = alsa_device::open_capture(
            &settings.device,
            settings.sample_rate,
            settings.channels,
            Some(settings.effective_block_size()),
        )?;
        pcm.start()?;

        let read_buf = vec![0i16; params.period_size * params.channels as usize];
        Ok(Self {
            pcm: Some(pcm),
            params,
            read_buf,
        })
    }

    pub fn params(&self) -> &AlsaParams {
        &self.params
    }

    /// Name of the device that was actually opened.
    pub fn device_name(&self) -> &str {
        &self.params.device
    }

    /// Read one period and return it as mono samples.
    ///
    /// Overruns are recovered in place and yield an empty block.
    pub fn read_block(&mut self) -> Result<Vec<i16>> {
        let Some(pcm) = self.pcm.as_ref() else {
            bail!("capture device is closed");
        };
        let channels = self.params.channels as usize;

        let io = pcm.io_i16()?;
        match io.readi(&mut self.read_buf) {
            Ok(frames) => Ok(downmix(&self.read_buf[..frames * channels], channels)),
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                pcm.prepare()?;
                pcm.start()?;
                Ok(Vec::new())
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(pcm) = self.pcm.take() {
            log::info!("Closing audio capture device '{}'...", self.params.device);
            drop(pcm);
            log::info!("Audio capture device closed.");
        }
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.close();
    }
}

// ======================== Capture pipeline ========================

/// Turns raw capture blocks into a loudness level and encoded packets.
pub struct CapturePipeline {
    engine: Arc<CodecEngine>,
    meter: Arc<CaptureLevelMeter>,
    accumulator: FrameAccumulator,
    packet_buf: Vec<u8>,
    encode_enabled: bool,
    transmitting: bool,
    burst_pending: bool,
}

impl CapturePipeline {
    pub fn new(engine: Arc<CodecEngine>, meter: Arc<CaptureLevelMeter>, sample_rate: u32) -> Self {
        let encode_enabled = sample_rate == SAMPLE_RATE;
        if !encode_enabled {
            log::warn!(
                "Capture rate {}Hz differs from codec rate {}Hz, voice transmit disabled (level meter only)",
                sample_rate,
                SAMPLE_RATE
            );
        }
        Self {
            engine,
            meter,
            accumulator: FrameAccumulator::new(),
            packet_buf: vec![0u8; MAX_PACKET_SIZE],
            encode_enabled,
            transmitting: true,
            burst_pending: true,
        }
    }

    /// Start a new talk burst: stale samples are dropped and the next packet
    /// is flagged so receivers reset their decoder.
    pub fn begin_burst(&mut self) {
        self.accumulator.clear();
        self.burst_pending = true;
    }

    /// Gate encoding. Resuming starts a new talk burst; while paused, blocks
    /// still reach the level meter but nothing is encoded.
    pub fn set_transmitting(&mut self, on: bool) {
        if on && !self.transmitting {
            self.begin_burst();
        }
        self.transmitting = on;
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    /// Feed one block of mono samples. Returns the packets for every native
    /// frame completed by this block.
    pub fn process(&mut self, block: &[i16]) -> Vec<OutboundPacket> {
        self.meter.update(block);

        if !self.encode_enabled || !self.transmitting {
            return Vec::new();
        }

        self.accumulator.push(block);
        let mut packets = Vec::new();
        while let Some(frame) = self.accumulator.next_frame() {
            match self.engine.encode(frame, &mut self.packet_buf) {
                Ok(len) => {
                    packets.push(OutboundPacket {
                        payload: Bytes::copy_from_slice(&self.packet_buf[..len]),
                        new_burst: std::mem::take(&mut self.burst_pending),
                    });
                }
                // Engine shut down underneath us; nothing to send.
                Err(CodecError::NotInitialized) => {}
                Err(e) => log::debug!("Dropping capture frame: {}", e),
            }
        }
        packets
    }

    pub fn level(&self) -> f32 {
        self.meter.level()
    }
}

// ======================== Capture thread ========================

pub fn capture_thread(
    settings: &CaptureSettings,
    engine: Arc<CodecEngine>,
    meter: Arc<CaptureLevelMeter>,
    packet_tx: mpsc::Sender<OutboundPacket>,
    running: &AtomicBool,
    transmit: &AtomicBool,
) -> Result<()> {
    let mut device = CaptureDevice::open(settings)?;
    let mut pipeline = CapturePipeline::new(engine, meter, device.params().sample_rate);
    pipeline.set_transmitting(transmit.load(Ordering::Relaxed));

    log::info!(
        "Capture started: device={}, rate={}, ch={}, block={}",
        device.device_name(),
        device.params().sample_rate,
        device.params().channels,
        device.params().period_size,
    );

    while running.load(Ordering::Relaxed) {
        let block = match device.read_block() {
            Ok(block) => block,
            Err(e) => {
                log::error!("Failed to recover PCM capture: {:#}", e);
                break;
            }
        };

        let on = transmit.load(Ordering::Relaxed);
        if on != pipeline.is_transmitting() {
            log::debug!("Voice transmit {}", if on { "resumed" } else { "paused" });
            pipeline.set_transmitting(on);
        }

        for packet in pipeline.process(&block) {
            if packet_tx.blocking_send(packet).is_err() {
                log::warn!("Outbound voice channel closed");
                device.close();
                return Ok(());
            }
        }
    }

    device.close();
    log::info!("Capture stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(sample_rate: u32) -> CapturePipeline {
        let engine = Arc::new(CodecEngine::default());
        engine.init().unwrap();
        CapturePipeline::new(engine, Arc::new(CaptureLevelMeter::new()), sample_rate)
    }

    fn tone(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| (f32::sin(i as f32 * 0.05) * 12000.0) as i16)
            .collect()
    }

    #[test]
    fn test_default_block_size() {
        let settings = CaptureSettings::default();
        assert_eq!(settings.effective_block_size(), DEFAULT_BLOCK_SIZE);

        let settings = CaptureSettings {
            block_size: 512,
            ..Default::default()
        };
        assert_eq!(settings.effective_block_size(), 512);
    }

    #[test]
    fn test_disabled_capture_does_not_open() {
        let settings = CaptureSettings {
            enabled: false,
            ..Default::default()
        };
        assert!(CaptureDevice::open(&settings).is_err());
    }

    #[test]
    fn test_reblocks_into_frames() {
        let mut pipeline = pipeline(SAMPLE_RATE);
        let audio = tone(FRAME_SIZE * 5 + 123);

        let mut packets = Vec::new();
        for block in audio.chunks(700) {
            packets.extend(pipeline.process(block));
        }

        assert_eq!(packets.len(), 5);
        for packet in &packets {
            assert!(!packet.payload.is_empty());
            assert!(packet.payload.len() <= MAX_PACKET_SIZE);
        }
    }

    #[test]
    fn test_only_first_packet_starts_burst() {
        let mut pipeline = pipeline(SAMPLE_RATE);
        let packets = pipeline.process(&tone(FRAME_SIZE * 3));

        let flags: Vec<bool> = packets.iter().map(|p| p.new_burst).collect();
        assert_eq!(flags, vec![true, false, false]);

        pipeline.begin_burst();
        let packets = pipeline.process(&tone(FRAME_SIZE));
        assert!(packets[0].new_burst);
    }

    #[test]
    fn test_resume_starts_new_burst() {
        let mut pipeline = pipeline(SAMPLE_RATE);
        let first = pipeline.process(&tone(FRAME_SIZE * 2));
        assert_eq!(first.len(), 2);

        pipeline.set_transmitting(false);
        let before = pipeline.level();
        // Paused: the meter keeps running, nothing is encoded.
        assert!(pipeline.process(&tone(FRAME_SIZE * 2 + 100)).is_empty());
        assert!(pipeline.level() > 0.0);
        assert_ne!(pipeline.level(), before);

        pipeline.set_transmitting(true);
        let packets = pipeline.process(&tone(FRAME_SIZE * 3));
        let flags: Vec<bool> = packets.iter().map(|p| p.new_burst).collect();
        assert_eq!(flags, vec![true, false, false]);

        // Resuming while already transmitting is not a new burst.
        pipeline.set_transmitting(true);
        let packets = pipeline.process(&tone(FRAME_SIZE));
        assert!(!packets[0].new_burst);
    }

    #[test]
    fn test_meter_sees_every_block() {
        let mut pipeline = pipeline(SAMPLE_RATE);
        // Shorter than a frame: no packet, but the level moves.
        let packets = pipeline.process(&tone(200));
        assert!(packets.is_empty());
        assert!(pipeline.level() > 0.0);
    }

    #[test]
    fn test_foreign_rate_is_meter_only() {
        let mut pipeline = pipeline(44100);
        let packets = pipeline.process(&tone(FRAME_SIZE * 2));
        assert!(packets.is_empty());
        assert!(pipeline.level() > 0.0);
    }

    #[test]
    fn test_shutdown_engine_drops_frames() {
        let engine = Arc::new(CodecEngine::default());
        let mut pipeline =
            CapturePipeline::new(engine.clone(), Arc::new(CaptureLevelMeter::new()), SAMPLE_RATE);

        // Never initialized: frames are dropped, metering continues.
        assert!(pipeline.process(&tone(FRAME_SIZE)).is_empty());
        assert!(pipeline.level() > 0.0);

        engine.init().unwrap();
        assert_eq!(pipeline.process(&tone(FRAME_SIZE)).len(), 1);
    }
}
