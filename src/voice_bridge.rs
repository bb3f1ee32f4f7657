//! UDP transport for voice packets.
//!
//! Datagram layout: `[slot u8][flags u8][sequence u16 BE][opus payload]`.
//! Flag bit 0 marks the first packet of a talk burst.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::audio::{MAX_PACKET_SIZE, OutboundPacket};

pub const HEADER_SIZE: usize = 4;
const FLAG_NEW_BURST: u8 = 0x01;

/// A voice packet received from a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub slot: usize,
    pub sequence: u16,
    /// Sender started a new talk burst; its decoder state is stale.
    pub discontinuity: bool,
    pub payload: Bytes,
}

pub fn encode_datagram(slot: u8, sequence: u16, packet: &OutboundPacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + packet.payload.len());
    buf.put_u8(slot);
    buf.put_u8(if packet.new_burst { FLAG_NEW_BURST } else { 0 });
    buf.put_u16(sequence);
    buf.put_slice(&packet.payload);
    buf.freeze()
}

pub fn parse_datagram(mut data: Bytes) -> Result<InboundPacket> {
    if data.len() <= HEADER_SIZE {
        bail!("datagram too short: {} bytes", data.len());
    }
    if data.len() - HEADER_SIZE > MAX_PACKET_SIZE {
        bail!("voice payload too large: {} bytes", data.len() - HEADER_SIZE);
    }

    let slot = data.get_u8() as usize;
    let flags = data.get_u8();
    let sequence = data.get_u16();

    Ok(InboundPacket {
        slot,
        sequence,
        discontinuity: flags & FLAG_NEW_BURST != 0,
        payload: data,
    })
}

// ======================== Sequence tracking ========================

/// How a packet's sequence number relates to the last one seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceGap {
    /// First packet, or the expected next one
    InOrder,
    /// This many packets went missing before this one
    Lost(u16),
    /// Late or duplicate packet
    Stale,
}

/// Per-slot loss detection over wrapping u16 sequence numbers.
#[derive(Debug)]
pub struct SequenceTracker {
    last: Box<[Option<u16>]>,
}

impl SequenceTracker {
    pub fn new(slots: usize) -> Self {
        Self {
            last: vec![None; slots].into_boxed_slice(),
        }
    }

    pub fn observe(&mut self, slot: usize, sequence: u16) -> SequenceGap {
        let Some(last) = self.last.get_mut(slot) else {
            return SequenceGap::InOrder;
        };
        let Some(prev) = *last else {
            *last = Some(sequence);
            return SequenceGap::InOrder;
        };

        let delta = sequence.wrapping_sub(prev);
        if delta == 0 || delta > u16::MAX / 2 {
            return SequenceGap::Stale;
        }
        *last = Some(sequence);
        if delta == 1 {
            SequenceGap::InOrder
        } else {
            SequenceGap::Lost(delta - 1)
        }
    }

    /// Forget the history of `slot` (new talk burst).
    pub fn reset(&mut self, slot: usize) {
        if let Some(last) = self.last.get_mut(slot) {
            *last = None;
        }
    }
}

// ======================== UDP bridge ========================

pub struct VoiceBridge {
    socket: Arc<UdpSocket>,
    target_addr: SocketAddr,
    local_slot: u8,
    sequence: u16,
}

impl VoiceBridge {
    pub async fn bind(local_port: u16, target_addr: SocketAddr, local_slot: u8) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .with_context(|| format!("Failed to bind voice socket on port {}", local_port))?;

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            local_slot,
            sequence: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send(&mut self, packet: &OutboundPacket) -> Result<()> {
        let datagram = encode_datagram(self.local_slot, self.sequence, packet);
        self.sequence = self.sequence.wrapping_add(1);
        self.socket.send_to(&datagram, self.target_addr).await?;
        Ok(())
    }

    /// Receive loop: forwards well-formed packets until the channel closes.
    pub fn spawn_receiver(&self, tx: mpsc::Sender<InboundPacket>) -> tokio::task::JoinHandle<Result<()>> {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; HEADER_SIZE + MAX_PACKET_SIZE + 1];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                match parse_datagram(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(packet) => {
                        if tx.send(packet).await.is_err() {
                            log::info!("Inbound voice channel closed");
                            return Ok(());
                        }
                    }
                    Err(e) => log::debug!("Dropping datagram from {}: {}", from, e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(payload: &'static [u8], new_burst: bool) -> OutboundPacket {
        OutboundPacket {
            payload: Bytes::from_static(payload),
            new_burst,
        }
    }

    #[test]
    fn test_datagram_header() {
        let datagram = encode_datagram(7, 0x0102, &outbound(b"\xAA\xBB", true));
        assert_eq!(&datagram[..], &[7, FLAG_NEW_BURST, 0x01, 0x02, 0xAA, 0xBB]);

        let packet = parse_datagram(datagram).unwrap();
        assert_eq!(packet.slot, 7);
        assert_eq!(packet.sequence, 0x0102);
        assert!(packet.discontinuity);
        assert_eq!(&packet.payload[..], b"\xAA\xBB");
    }

    #[test]
    fn test_rejects_malformed_datagrams() {
        assert!(parse_datagram(Bytes::from_static(&[1, 0, 0])).is_err());
        // Header without payload.
        assert!(parse_datagram(Bytes::from_static(&[1, 0, 0, 1])).is_err());

        let oversized = Bytes::from(vec![0u8; HEADER_SIZE + MAX_PACKET_SIZE + 1]);
        assert!(parse_datagram(oversized).is_err());
    }

    #[test]
    fn test_sequence_gaps() {
        let mut tracker = SequenceTracker::new(4);
        assert_eq!(tracker.observe(1, 10), SequenceGap::InOrder);
        assert_eq!(tracker.observe(1, 11), SequenceGap::InOrder);
        assert_eq!(tracker.observe(1, 13), SequenceGap::Lost(1));
        assert_eq!(tracker.observe(1, 17), SequenceGap::Lost(3));
        assert_eq!(tracker.observe(1, 15), SequenceGap::Stale);
        assert_eq!(tracker.observe(1, 17), SequenceGap::Stale);

        // Slots are independent.
        assert_eq!(tracker.observe(2, 500), SequenceGap::InOrder);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut tracker = SequenceTracker::new(1);
        tracker.observe(0, u16::MAX - 1);
        assert_eq!(tracker.observe(0, u16::MAX), SequenceGap::InOrder);
        assert_eq!(tracker.observe(0, 0), SequenceGap::InOrder);
        assert_eq!(tracker.observe(0, 2), SequenceGap::Lost(1));
    }

    #[test]
    fn test_sequence_reset() {
        let mut tracker = SequenceTracker::new(1);
        tracker.observe(0, 100);
        tracker.reset(0);
        assert_eq!(tracker.observe(0, 3), SequenceGap::InOrder);
    }

    #[tokio::test]
    async fn test_bridge_loopback() {
        let receiver = VoiceBridge::bind(0, "127.0.0.1:9".parse().unwrap(), 0).await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], receiver.local_addr().unwrap().port()));
        let mut sender = VoiceBridge::bind(0, target, 5).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = receiver.spawn_receiver(tx);

        sender.send(&outbound(b"first", true)).await.unwrap();
        sender.send(&outbound(b"second", false)).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.slot, first.sequence, first.discontinuity), (5, 0, true));
        assert_eq!(&first.payload[..], b"first");

        let second = rx.recv().await.unwrap();
        assert_eq!((second.sequence, second.discontinuity), (1, false));

        handle.abort();
    }
}
