//! audio - Voice capture, codec and playback
//!
//! Uses ALSA for audio I/O and Opus (with in-band FEC) for encoding and
//! per-participant decoding.

mod alsa_device;
mod audio_system;
mod capture;
mod level_meter;
mod playback;
mod reblock;
mod voice_codec;

pub use audio_system::{VoiceConfig, VoiceSystem};
pub use capture::{CaptureDevice, CapturePipeline, CaptureSettings, OutboundPacket};
pub use level_meter::CaptureLevelMeter;
pub use playback::{PlaybackMixer, PlaybackSettings};
pub use reblock::FrameAccumulator;
pub use voice_codec::{
    CodecEngine, CodecError, DEFAULT_BITRATE, FRAME_SIZE, MAX_PACKET_SIZE, MAX_PARTICIPANTS,
    SAMPLE_RATE,
};
