//! Opus voice codec engine: one encoder plus one lazily created decoder per
//! participant slot.
//!
//! - Encoder: 48 kHz mono VoIP profile, in-band FEC on, tuned for 10% loss
//! - Decoders: created on the first packet for a slot, reset on discontinuity
//!
//! Every method takes `&self`. The encoder and each decoder slot sit behind
//! their own lock, so the capture path (encode) and the network path (decode)
//! never contend, while two decodes for the same slot are serialized.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use opus::{Application, Bitrate, Channels, Decoder, Encoder};
use parking_lot::Mutex;
use thiserror::Error;

// ======================== Constants ========================

/// Codec sample rate in Hz.
pub const SAMPLE_RATE: u32 = 48000;
/// Samples per native frame (20ms at 48kHz, mono).
pub const FRAME_SIZE: usize = 960;
/// Upper bound on an encoded packet; one packet always decodes to one frame.
pub const MAX_PACKET_SIZE: usize = 1024;
/// Default target bitrate in bits/s.
pub const DEFAULT_BITRATE: i32 = 32000;
/// Expected packet loss the encoder allocates FEC redundancy for.
pub const EXPECTED_PACKET_LOSS_PERCENT: i32 = 10;
/// Default number of participant slots.
pub const MAX_PARTICIPANTS: usize = 64;

const CHANNELS: Channels = Channels::Mono;

// ======================== Errors ========================

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec engine is not initialized")]
    NotInitialized,
    #[error("participant slot {slot} out of range (max {max})")]
    InvalidSlot { slot: usize, max: usize },
    #[error("expected a frame of {expected} samples, got {0}", expected = FRAME_SIZE)]
    InvalidFrameSize(usize),
    #[error("no decoder allocated for slot {0}")]
    NoDecoder(usize),
    #[error("opus: {0}")]
    Codec(#[from] opus::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

// ======================== Codec Engine ========================

pub struct CodecEngine {
    encoder: Mutex<Option<Encoder>>,
    decoders: Box<[Mutex<Option<Decoder>>]>,
    initialized: AtomicBool,
    decoder_allocations: AtomicUsize,
}

impl CodecEngine {
    /// Create an inert engine with `max_slots` participant slots.
    /// Call [`CodecEngine::init`] before encoding.
    pub fn new(max_slots: usize) -> Self {
        let decoders = (0..max_slots).map(|_| Mutex::new(None)).collect();
        Self {
            encoder: Mutex::new(None),
            decoders,
            initialized: AtomicBool::new(false),
            decoder_allocations: AtomicUsize::new(0),
        }
    }

    /// Create the encoder. Calling this on an initialized engine is a no-op.
    pub fn init(&self) -> Result<()> {
        let mut encoder = self.encoder.lock();
        if encoder.is_some() {
            return Ok(());
        }

        let created = create_encoder().inspect_err(|e| {
            log::error!("VoiceCodec: failed to create encoder: {}", e);
        })?;
        *encoder = Some(created);

        self.decoder_allocations.store(0, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);

        log::info!(
            "VoiceCodec: initialized with FEC enabled ({}% packet loss tolerance)",
            EXPECTED_PACKET_LOSS_PERCENT
        );
        Ok(())
    }

    /// Release the encoder and every decoder. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.initialized.store(false, Ordering::Release);
        self.encoder.lock().take();
        for slot in self.decoders.iter() {
            slot.lock().take();
        }
    }

    /// Clear encoder state and the state of every allocated decoder.
    /// Nothing is deallocated.
    pub fn reset(&self) {
        if let Some(encoder) = self.encoder.lock().as_mut() {
            if let Err(e) = encoder.reset_state() {
                log::debug!("VoiceCodec: encoder reset failed: {}", e);
            }
        }
        for slot in 0..self.decoders.len() {
            self.reset_decoder(slot);
        }
    }

    /// Change the encoder's target bitrate. No-op without an encoder.
    pub fn set_bitrate(&self, bits_per_second: i32) {
        if let Some(encoder) = self.encoder.lock().as_mut() {
            if let Err(e) = encoder.set_bitrate(Bitrate::Bits(bits_per_second)) {
                log::debug!("VoiceCodec: set bitrate {} failed: {}", bits_per_second, e);
            }
        }
    }

    /// Current encoder bitrate, if an encoder exists.
    pub fn bitrate(&self) -> Option<i32> {
        let mut encoder = self.encoder.lock();
        match encoder.as_mut()?.get_bitrate() {
            Ok(Bitrate::Bits(bits)) => Some(bits),
            Ok(_) | Err(_) => None,
        }
    }

    /// Clear one participant's decoder state (new talk burst). Invalid slots
    /// and slots without a decoder are ignored.
    pub fn reset_decoder(&self, slot: usize) {
        let Some(cell) = self.decoders.get(slot) else {
            return;
        };
        if let Some(decoder) = cell.lock().as_mut() {
            if let Err(e) = decoder.reset_state() {
                log::debug!("VoiceCodec: decoder {} reset failed: {}", slot, e);
            }
        }
    }

    /// Encode exactly one native frame into `out`.
    ///
    /// At most [`MAX_PACKET_SIZE`] bytes are written. Returns the number of
    /// bytes written. Codec failures are logged at debug level; the caller
    /// should drop the frame and carry on.
    pub fn encode(&self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        if !self.is_initialized() {
            return Err(CodecError::NotInitialized);
        }
        if pcm.len() != FRAME_SIZE {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let mut guard = self.encoder.lock();
        let encoder = guard.as_mut().ok_or(CodecError::NotInitialized)?;

        let limit = out.len().min(MAX_PACKET_SIZE);
        encoder.encode(pcm, &mut out[..limit]).map_err(|e| {
            log::debug!("VoiceCodec: encode failed: {}", e);
            CodecError::from(e)
        })
    }

    /// Decode one packet from participant `slot` into `out`.
    ///
    /// The slot's decoder is created on first use. With `use_fec` the
    /// redundancy carried in `packet` is used to rebuild the frame *before*
    /// it, so a single lost packet is recovered one frame late. Returns the
    /// number of samples written.
    pub fn decode(&self, slot: usize, packet: &[u8], out: &mut [i16], use_fec: bool) -> Result<usize> {
        let cell = self.slot(slot)?;
        let mut guard = cell.lock();

        let decoder = match guard.as_mut() {
            Some(decoder) => decoder,
            None => {
                let created = create_decoder().inspect_err(|e| {
                    log::error!("VoiceCodec: failed to create decoder for slot {}: {}", slot, e);
                })?;
                self.decoder_allocations.fetch_add(1, Ordering::Relaxed);
                guard.insert(created)
            }
        };

        decoder.decode(packet, out, use_fec).map_err(|e| {
            log::debug!("VoiceCodec: decode failed for slot {}: {}", slot, e);
            CodecError::from(e)
        })
    }

    /// Packet loss concealment: synthesize one frame for `slot` from its
    /// decoder history. Requires a decoder that has already seen packets.
    pub fn decode_lost(&self, slot: usize, out: &mut [i16]) -> Result<usize> {
        let cell = self.slot(slot)?;
        let mut guard = cell.lock();
        let decoder = guard.as_mut().ok_or(CodecError::NoDecoder(slot))?;

        let len = out.len().min(FRAME_SIZE);
        decoder.decode(&[], &mut out[..len], false).map_err(|e| {
            log::debug!("VoiceCodec: PLC failed for slot {}: {}", slot, e);
            CodecError::from(e)
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn max_slots(&self) -> usize {
        self.decoders.len()
    }

    pub fn has_decoder(&self, slot: usize) -> bool {
        self.decoders
            .get(slot)
            .is_some_and(|cell| cell.lock().is_some())
    }

    /// Number of slots currently holding a decoder.
    pub fn active_decoders(&self) -> usize {
        self.decoders.iter().filter(|cell| cell.lock().is_some()).count()
    }

    /// Decoders created since the last successful `init`.
    pub fn decoder_allocations(&self) -> usize {
        self.decoder_allocations.load(Ordering::Relaxed)
    }

    fn slot(&self, slot: usize) -> Result<&Mutex<Option<Decoder>>> {
        self.decoders.get(slot).ok_or(CodecError::InvalidSlot {
            slot,
            max: self.decoders.len(),
        })
    }
}

impl Default for CodecEngine {
    fn default() -> Self {
        Self::new(MAX_PARTICIPANTS)
    }
}

impl Drop for CodecEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn create_encoder() -> std::result::Result<Encoder, opus::Error> {
    let mut encoder = Encoder::new(SAMPLE_RATE, CHANNELS, Application::Voip)?;
    encoder.set_bitrate(Bitrate::Bits(DEFAULT_BITRATE))?;
    encoder.set_inband_fec(true)?;
    encoder.set_packet_loss_perc(EXPECTED_PACKET_LOSS_PERCENT)?;
    Ok(encoder)
}

fn create_decoder() -> std::result::Result<Decoder, opus::Error> {
    Decoder::new(SAMPLE_RATE, CHANNELS)
}

// ======================== Tests ========================
