use std::net::SocketAddr;

use crate::audio::{CaptureSettings, PlaybackSettings, VoiceConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 采集配置
    pub capture_enabled: bool,
    pub capture_device: &'static str,
    pub capture_sample_rate: u32,
    pub capture_channels: u32,
    pub capture_block_size: usize,

    // 播放配置
    pub playback_device: &'static str,
    pub playback_sample_rate: u32,
    pub playback_channels: u32,
    pub playback_period_size: usize,
    pub master_gain: f32,

    // 编解码配置
    pub voice_bitrate: i32,
    pub max_participants: usize,

    // 网络配置
    pub local_port: u16,
    pub remote_addr: SocketAddr,
    pub local_slot: u8,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            capture_enabled: env!("CAPTURE_ENABLED").parse()
                .map_err(|_| "Failed to parse CAPTURE_ENABLED")?,
            capture_device: env!("CAPTURE_DEVICE"),
            capture_sample_rate: env!("CAPTURE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse CAPTURE_SAMPLE_RATE")?,
            capture_channels: env!("CAPTURE_CHANNELS").parse()
                .map_err(|_| "Failed to parse CAPTURE_CHANNELS")?,
            capture_block_size: env!("CAPTURE_BLOCK_SIZE").parse()
                .map_err(|_| "Failed to parse CAPTURE_BLOCK_SIZE")?,

            playback_device: env!("PLAYBACK_DEVICE"),
            playback_sample_rate: env!("PLAYBACK_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_SAMPLE_RATE")?,
            playback_channels: env!("PLAYBACK_CHANNELS").parse()
                .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
            master_gain: env!("PLAYBACK_MASTER_GAIN").parse()
                .map_err(|_| "Failed to parse PLAYBACK_MASTER_GAIN")?,

            voice_bitrate: env!("VOICE_BITRATE").parse()
                .map_err(|_| "Failed to parse VOICE_BITRATE")?,
            max_participants: env!("VOICE_MAX_PARTICIPANTS").parse()
                .map_err(|_| "Failed to parse VOICE_MAX_PARTICIPANTS")?,

            local_port: env!("NET_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse NET_LOCAL_PORT")?,
            remote_addr: env!("NET_REMOTE_ADDR").parse()
                .map_err(|_| "Failed to parse NET_REMOTE_ADDR")?,
            local_slot: env!("NET_LOCAL_SLOT").parse()
                .map_err(|_| "Failed to parse NET_LOCAL_SLOT")?,
        })
    }

    pub fn voice_config(&self) -> VoiceConfig {
        VoiceConfig {
            capture: CaptureSettings {
                enabled: self.capture_enabled,
                device: self.capture_device.to_string(),
                sample_rate: self.capture_sample_rate,
                channels: self.capture_channels,
                block_size: self.capture_block_size,
            },
            playback: PlaybackSettings {
                device: self.playback_device.to_string(),
                sample_rate: self.playback_sample_rate,
                channels: self.playback_channels,
                period_size: self.playback_period_size,
                master_gain: self.master_gain,
            },
            bitrate: self.voice_bitrate,
            max_participants: self.max_participants,
        }
    }
}
