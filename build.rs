use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    capture: Capture,
    playback: Playback,
    voice: Voice,
    network: Network,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Capture {
    enabled: bool,
    device: String,
    sample_rate: u32,
    channels: u32,
    block_size: usize,
}

#[derive(Deserialize)]
struct Playback {
    device: String,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
    master_gain: f32,
}

#[derive(Deserialize)]
struct Voice {
    bitrate: i32,
    max_participants: usize,
}

#[derive(Deserialize)]
struct Network {
    local_port: u16,
    remote_addr: String,
    local_slot: u8,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 采集配置
    println!("cargo:rustc-env=CAPTURE_ENABLED={}", config.capture.enabled);
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.capture.device);
    println!("cargo:rustc-env=CAPTURE_SAMPLE_RATE={}", config.capture.sample_rate);
    println!("cargo:rustc-env=CAPTURE_CHANNELS={}", config.capture.channels);
    println!("cargo:rustc-env=CAPTURE_BLOCK_SIZE={}", config.capture.block_size);

    // 播放配置
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.playback.device);
    println!("cargo:rustc-env=PLAYBACK_SAMPLE_RATE={}", config.playback.sample_rate);
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.playback.channels);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.playback.period_size);
    println!("cargo:rustc-env=PLAYBACK_MASTER_GAIN={}", config.playback.master_gain);

    // 编解码配置
    println!("cargo:rustc-env=VOICE_BITRATE={}", config.voice.bitrate);
    println!("cargo:rustc-env=VOICE_MAX_PARTICIPANTS={}", config.voice.max_participants);

    // 网络配置
    println!("cargo:rustc-env=NET_LOCAL_PORT={}", config.network.local_port);
    println!("cargo:rustc-env=NET_REMOTE_ADDR={}", config.network.remote_addr);
    println!("cargo:rustc-env=NET_LOCAL_SLOT={}", config.network.local_slot);
}
