use std::time::Duration;

use tokio::signal;
use tokio::sync::mpsc;
use voice_core::audio::{OutboundPacket, VoiceSystem};
use voice_core::config::Config;
use voice_core::voice_bridge::{InboundPacket, VoiceBridge};

/// How often the capture level is reported.
const LEVEL_REPORT_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    log::info!("{} {} starting", config.app_name, config.app_version);

    // 编码器初始化失败时语音保持禁用
    let mut voice = VoiceSystem::new(config.voice_config())?;

    // 出站：采集线程 -> 网络；入站：网络 -> 解码
    let (tx_outbound, mut rx_outbound) = mpsc::channel::<OutboundPacket>(100);
    let (tx_inbound, mut rx_inbound) = mpsc::channel::<InboundPacket>(100);

    let mut bridge =
        VoiceBridge::bind(config.local_port, config.remote_addr, config.local_slot).await?;
    let receiver = bridge.spawn_receiver(tx_inbound);

    voice.start(tx_outbound)?;
    // 独立运行时保持麦克风常开
    voice.start_capture();

    let mut level_tick = tokio::time::interval(LEVEL_REPORT_INTERVAL);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(packet) = rx_outbound.recv() => {
                if let Err(e) = bridge.send(&packet).await {
                    log::debug!("Failed to send voice packet: {}", e);
                }
            }

            Some(packet) = rx_inbound.recv() => {
                voice.receive(&packet);
            }

            _ = level_tick.tick() => {
                log::debug!("Capture level: {:.3}", voice.capture_level());
            }
        }
    }

    receiver.abort();
    // 关闭出站通道，避免采集线程阻塞在发送上
    drop(rx_outbound);
    voice.stop();
    Ok(())
}
