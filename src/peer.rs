use crate::aprs::{parse_packet, AprsPacket};
use crate::config::PeerConfig;
use crate::router::{PacketSource, RoutedPacket, RouterEvent};
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Maintains one outbound peer-server link: locally admitted traffic goes
/// out, peer traffic comes in tagged with the peer's name.
pub async fn run_peer_link(
    config: PeerConfig,
    server_call: String,
    event_tx: mpsc::Sender<RouterEvent>,
    peer_rx: broadcast::Receiver<AprsPacket>,
) -> Result<()> {
    loop {
        match connect_and_run(&config, &server_call, &event_tx, peer_rx.resubscribe()).await {
            Ok(()) => warn!(
                "Peer {} closed, reconnecting in {}s",
                config.name,
                RECONNECT_DELAY.as_secs()
            ),
            Err(e) => error!(
                "Peer {} error: {}, reconnecting in {}s",
                config.name,
                e,
                RECONNECT_DELAY.as_secs()
            ),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_run(
    config: &PeerConfig,
    server_call: &str,
    event_tx: &mpsc::Sender<RouterEvent>,
    mut peer_rx: broadcast::Receiver<AprsPacket>,
) -> Result<()> {
    info!(
        "Connecting to peer {} at {}:{}",
        config.name, config.host, config.port
    );

    let stream = timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| anyhow!("connect timeout"))??;

    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let login = format!(
        "user {} pass {} vers aprsgate {}\r\n",
        server_call,
        config.passcode,
        env!("CARGO_PKG_VERSION")
    );
    writer.write_all(login.as_bytes()).await?;
    info!("Peer {} link up", config.name);

    let mut line = Vec::new();
    loop {
        line.clear();
        tokio::select! {
            result = reader.read_until(b'\n', &mut line) => {
                match result {
                    Ok(0) => return Ok(()),
                    Ok(_) => {
                        if line.first() == Some(&b'#') {
                            debug!(
                                "Peer {} comment: {}",
                                config.name,
                                String::from_utf8_lossy(&line).trim()
                            );
                            continue;
                        }
                        match parse_packet(&line) {
                            Ok(packet) => {
                                debug!("RX [peer {}]: {}", config.name, packet);
                                let routed = RoutedPacket {
                                    packet,
                                    source: PacketSource::Peer(config.name.clone()),
                                };
                                let _ = event_tx.send(RouterEvent::Packet(routed)).await;
                            }
                            Err(e) => debug!("Bad line from peer {}: {}", config.name, e),
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            Ok(packet) = peer_rx.recv() => {
                let mut out = packet.encode();
                out.extend_from_slice(b"\r\n");
                writer.write_all(&out).await?;
                debug!("TX [peer {}]: {}", config.name, packet);
            }
        }
    }
}
