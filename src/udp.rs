use crate::aprs::{parse_packet, AprsPacket, CallSign, PathElement};
use crate::config::UdpConfig;
use crate::rf::ax25_to_tnc2;
use crate::rf::kiss::{looks_like_kiss, KissCodec};
use crate::router::{PacketSource, RoutedPacket, RouterEvent};
use anyhow::Result;
use bytes::BytesMut;
use log::{debug, info};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Deserialize)]
struct JsonSubmission {
    source: String,
    destination: Option<String>,
    path: Option<Vec<String>>,
    data: String,
}

/// One-shot packet submissions over UDP. A datagram is either a KISS data
/// frame, a JSON object, or a literal APRS line; anything else is dropped
/// silently.
pub async fn run_udp_listener(
    config: UdpConfig,
    event_tx: mpsc::Sender<RouterEvent>,
) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", config.port)).await?;
    info!("UDP submission listener on port {}", config.port);

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        match decode_datagram(&buf[..n]) {
            Some(packet) => {
                debug!("RX [udp {}]: {}", peer, packet);
                let routed = RoutedPacket {
                    packet,
                    source: PacketSource::Udp,
                };
                let _ = event_tx.send(RouterEvent::Packet(routed)).await;
            }
            None => debug!("Dropping invalid datagram from {}", peer),
        }
    }
}

fn decode_datagram(data: &[u8]) -> Option<AprsPacket> {
    if looks_like_kiss(data) {
        let mut codec = KissCodec::new();
        let mut buf = BytesMut::from(data);
        let (_, frame) = codec.decode(&mut buf)?;
        let line = ax25_to_tnc2(&frame).ok()?;
        parse_packet(&line).ok()
    } else if data.first() == Some(&b'{') {
        let sub: JsonSubmission = serde_json::from_slice(data).ok()?;
        let source = CallSign::parse(&sub.source)?;
        let destination = CallSign::parse(sub.destination.as_deref().unwrap_or("APRS"))?;
        let mut packet = AprsPacket::new(source, destination, sub.data.into_bytes());
        if let Some(path) = sub.path {
            packet.path = path.iter().filter_map(|t| PathElement::parse(t)).collect();
        }
        Some(packet)
    } else {
        parse_packet(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rf::tnc2_to_ax25;

    #[test]
    fn test_literal_line() {
        let packet = decode_datagram(b"N0CALL>APRS:>from udp\r\n").unwrap();
        assert_eq!(packet.source.call, "N0CALL");
        assert_eq!(packet.data, b">from udp".to_vec());
    }

    #[test]
    fn test_kiss_datagram() {
        let original = parse_packet(b"N0CALL-5>APRS,WIDE1-1:!3553.50N/10602.50W>").unwrap();
        let frame = tnc2_to_ax25(&original).unwrap();
        let datagram = KissCodec::new().encode(&frame, 0);

        let packet = decode_datagram(&datagram).unwrap();
        assert_eq!(packet.source, original.source);
        assert_eq!(packet.data, original.data);
    }

    #[test]
    fn test_json_datagram() {
        let packet = decode_datagram(
            br#"{"source": "N0CALL-9", "path": ["WIDE1-1"], "data": ">json submission"}"#,
        )
        .unwrap();
        assert_eq!(packet.source.to_string(), "N0CALL-9");
        assert_eq!(packet.destination.call, "APRS");
        assert_eq!(packet.path.len(), 1);
        assert_eq!(packet.data, b">json submission".to_vec());

        let packet = decode_datagram(
            br#"{"source": "N0CALL", "destination": "APDW16", "data": ">x"}"#,
        )
        .unwrap();
        assert_eq!(packet.destination.call, "APDW16");
    }

    #[test]
    fn test_invalid_datagrams_dropped() {
        assert!(decode_datagram(b"").is_none());
        assert!(decode_datagram(b"not a packet").is_none());
        assert!(decode_datagram(br#"{"source": "BAD CALL", "data": "x"}"#).is_none());
        assert!(decode_datagram(br#"{"data": "missing source"}"#).is_none());
        // KISS framing with garbage inside
        assert!(decode_datagram(&[0xC0, 0x00, 0x01, 0x02, 0xC0]).is_none());
    }
}
