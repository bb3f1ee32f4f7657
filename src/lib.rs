//! Real-time voice chat core for a multiplayer game client.

pub mod audio;
pub mod config;
pub mod voice_bridge;
