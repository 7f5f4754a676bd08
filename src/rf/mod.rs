pub mod kiss;

use crate::aprs::{parse_packet, AprsPacket};
use crate::router::{PacketSource, RoutedPacket, RouterEvent};
use crate::config::RfInterfaceConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use kiss::KissCodec;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Transmit/receive seam for one RF attachment. The production link is a
/// KISS TNC over TCP; tests drive the packet plane without one.
#[async_trait]
pub trait RfLink: Send {
    /// Next AX.25 frame, or None when the link closed.
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>>;
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
}

pub struct KissTcpLink {
    stream: TcpStream,
    codec: KissCodec,
    read_buf: BytesMut,
}

impl KissTcpLink {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await??;
        Ok(KissTcpLink {
            stream,
            codec: KissCodec::new(),
            read_buf: BytesMut::with_capacity(1024),
        })
    }
}

#[async_trait]
impl RfLink for KissTcpLink {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some((port, frame)) = self.codec.decode(&mut self.read_buf) {
                debug!("KISS data frame on port {}: {} bytes", port, frame.len());
                return Ok(Some(frame));
            }
            let mut chunk = [0u8; 256];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let kiss_frame = self.codec.encode(frame, 0);
        self.stream.write_all(&kiss_frame).await?;
        Ok(())
    }
}

/// Runs one RF interface: reads KISS frames into the coordinator, drains
/// the RF broadcast channel back out, reconnects on failure.
pub async fn run_rf_interface(
    config: RfInterfaceConfig,
    event_tx: mpsc::Sender<RouterEvent>,
    rf_rx: broadcast::Receiver<AprsPacket>,
) -> Result<()> {
    loop {
        info!(
            "Connecting RF interface {} to {}:{}",
            config.name, config.host, config.port
        );
        match KissTcpLink::connect(&config.host, config.port).await {
            Ok(link) => {
                info!("RF interface {} connected", config.name);
                if let Err(e) =
                    run_link(&config, link, event_tx.clone(), rf_rx.resubscribe()).await
                {
                    error!("RF interface {} error: {}", config.name, e);
                }
            }
            Err(e) => {
                warn!("RF interface {} connect failed: {}", config.name, e);
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_link(
    config: &RfInterfaceConfig,
    mut link: impl RfLink,
    event_tx: mpsc::Sender<RouterEvent>,
    mut rf_rx: broadcast::Receiver<AprsPacket>,
) -> Result<()> {
    loop {
        tokio::select! {
            frame = link.recv_frame() => {
                match frame? {
                    Some(frame) => {
                        let Ok(line) = ax25_to_tnc2(&frame) else {
                            debug!("Undecodable AX.25 frame on {}", config.name);
                            continue;
                        };
                        match parse_packet(&line) {
                            Ok(packet) => {
                                info!("RX [{}]: {}", config.name, packet);
                                if config.rx_enable {
                                    let routed = RoutedPacket {
                                        packet,
                                        source: PacketSource::Rf(config.name.clone()),
                                    };
                                    let _ = event_tx.send(RouterEvent::Packet(routed)).await;
                                }
                            }
                            Err(e) => debug!("Unparseable frame on {}: {}", config.name, e),
                        }
                    }
                    None => return Err(anyhow!("link closed")),
                }
            }

            Ok(packet) = rf_rx.recv() => {
                if config.tx_enable {
                    match tnc2_to_ax25(&packet) {
                        Ok(frame) => {
                            link.send_frame(&frame).await?;
                            info!("TX [{}]: {}", config.name, packet);
                        }
                        Err(e) => warn!("Cannot encode {} for AX.25: {}", packet, e),
                    }
                }
            }
        }
    }
}

/// Decodes a UI frame into the TNC2 line form the packet parser accepts.
/// Information-field bytes pass through untouched.
pub fn ax25_to_tnc2(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 16 {
        return Err(anyhow!("frame too short"));
    }

    let mut i = 0;

    let dest = decode_address(&frame[i..i + 7])?;
    i += 7;

    let src = decode_address(&frame[i..i + 7])?;
    i += 7;
    let mut last = frame[i - 1] & 0x01 == 0x01;

    let mut line = Vec::with_capacity(frame.len() + 16);
    line.extend_from_slice(src.as_bytes());
    line.push(b'>');
    line.extend_from_slice(dest.as_bytes());

    while !last {
        if i + 7 > frame.len() {
            return Err(anyhow!("truncated address field"));
        }
        let digi = decode_address(&frame[i..i + 7])?;
        line.push(b',');
        line.extend_from_slice(digi.as_bytes());
        // H bit marks a used hop
        if frame[i + 6] & 0x80 != 0 {
            line.push(b'*');
        }
        last = frame[i + 6] & 0x01 == 0x01;
        i += 7;
    }

    if i + 2 > frame.len() || frame[i] != 0x03 || frame[i + 1] != 0xF0 {
        return Err(anyhow!("not a UI frame"));
    }
    i += 2;

    line.push(b':');
    line.extend_from_slice(&frame[i..]);
    Ok(line)
}

fn decode_address(data: &[u8]) -> Result<String> {
    if data.len() < 7 {
        return Err(anyhow!("invalid AX.25 address"));
    }

    let mut call = String::new();
    for &byte in data.iter().take(6) {
        let c = (byte >> 1) as char;
        if c != ' ' {
            call.push(c);
        }
    }
    if call.is_empty() {
        return Err(anyhow!("empty AX.25 address"));
    }

    let ssid = (data[6] >> 1) & 0x0F;
    if ssid > 0 {
        call.push_str(&format!("-{}", ssid));
    }

    Ok(call)
}

/// Encodes a packet as an AX.25 UI frame: destination, source, digipeater
/// path, control 0x03, PID 0xF0, information field.
pub fn tnc2_to_ax25(packet: &AprsPacket) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(packet.data.len() + 7 * (2 + packet.path.len()) + 2);

    encode_address(&packet.destination.call, packet.destination.ssid, false, false, &mut frame)?;

    let last = packet.path.is_empty();
    encode_address(&packet.source.call, packet.source.ssid, false, last, &mut frame)?;

    for (i, hop) in packet.path.iter().enumerate() {
        let (call, ssid) = split_ssid(&hop.element)?;
        let last = i == packet.path.len() - 1;
        encode_address(&call, ssid, hop.used, last, &mut frame)?;
    }

    frame.push(0x03); // UI frame
    frame.push(0xF0); // no layer 3

    frame.extend_from_slice(&packet.data);
    Ok(frame)
}

fn split_ssid(element: &str) -> Result<(String, u8)> {
    match element.split_once('-') {
        Some((call, ssid)) => {
            let ssid: u8 = ssid
                .parse()
                .map_err(|_| anyhow!("bad SSID in path element {}", element))?;
            Ok((call.to_string(), ssid))
        }
        None => Ok((element.to_string(), 0)),
    }
}

fn encode_address(call: &str, ssid: u8, used: bool, last: bool, frame: &mut Vec<u8>) -> Result<()> {
    if call.is_empty() || call.len() > 6 || !call.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
        return Err(anyhow!("address {} not encodable", call));
    }

    let mut addr = [0x20u8 << 1; 7]; // space-padded

    for (i, &b) in call.as_bytes().iter().enumerate() {
        addr[i] = b << 1;
    }

    addr[6] = ((ssid & 0x0F) << 1) | 0x60;
    if used {
        addr[6] |= 0x80;
    }
    if last {
        addr[6] |= 0x01;
    }

    frame.extend_from_slice(&addr);
    Ok(())
}
