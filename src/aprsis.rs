use crate::aprs::{parse_packet, AprsPacket};
use crate::config::AprsIsConfig;
use crate::router::{LinkState, PacketSource, RoutedPacket, RouterEvent};
use crate::server::aprs_passcode;
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
// Three missed keepalive windows of silence force a reconnect
const SILENCE_LIMIT: Duration = Duration::from_secs(180);
const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Persistent APRS-IS uplink: login, keepalive, auto-reconnect. Received
/// packets flow to the coordinator; the IS broadcast channel drains out.
pub async fn run_aprsis_client(
    config: AprsIsConfig,
    event_tx: mpsc::Sender<RouterEvent>,
    is_rx: broadcast::Receiver<AprsPacket>,
) -> Result<()> {
    loop {
        let _ = event_tx.send(RouterEvent::IsLink(LinkState::Connecting)).await;
        match connect_and_run(&config, &event_tx, is_rx.resubscribe()).await {
            Ok(()) => {
                warn!(
                    "APRS-IS connection closed, reconnecting in {}s",
                    RECONNECT_DELAY.as_secs()
                );
            }
            Err(e) => {
                error!(
                    "APRS-IS connection error: {}, reconnecting in {}s",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
            }
        }
        let _ = event_tx
            .send(RouterEvent::IsLink(LinkState::Disconnected))
            .await;
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_run(
    config: &AprsIsConfig,
    event_tx: &mpsc::Sender<RouterEvent>,
    mut is_rx: broadcast::Receiver<AprsPacket>,
) -> Result<()> {
    info!("Connecting to APRS-IS {}:{}", config.server, config.port);

    // Resolve per attempt; the rotate addresses change
    let stream = timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((config.server.as_str(), config.port)),
    )
    .await
    .map_err(|_| anyhow!("connect timeout"))??;

    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).await?;
    info!(
        "APRS-IS banner: {}",
        String::from_utf8_lossy(&line).trim()
    );

    let passcode: i32 = config
        .passcode
        .parse()
        .unwrap_or_else(|_| aprs_passcode(&config.callsign));

    let login = format!(
        "user {} pass {} vers {} {}{}\r\n",
        config.callsign,
        passcode,
        config.software,
        config.version,
        config
            .filter
            .as_ref()
            .map(|f| format!(" filter {}", f))
            .unwrap_or_default()
    );
    writer.write_all(login.as_bytes()).await?;
    debug!("Sent APRS-IS login for {}", config.callsign);

    let _ = event_tx.send(RouterEvent::IsLink(LinkState::Connected)).await;

    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // first tick fires immediately
    let mut last_rx = Instant::now();

    loop {
        line.clear();
        tokio::select! {
            result = reader.read_until(b'\n', &mut line) => {
                match result {
                    Ok(0) => {
                        info!("APRS-IS connection closed by server");
                        return Ok(());
                    }
                    Ok(_) => {
                        last_rx = Instant::now();
                        handle_line(config, event_tx, &line).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            Ok(packet) = is_rx.recv() => {
                if config.tx_enable {
                    let mut out = packet.encode();
                    out.extend_from_slice(b"\r\n");
                    writer.write_all(&out).await?;
                    info!("TX [APRS-IS]: {}", packet);
                }
            }

            _ = keepalive.tick() => {
                if last_rx.elapsed() > SILENCE_LIMIT {
                    return Err(anyhow!(
                        "no traffic for {}s, forcing reconnect",
                        last_rx.elapsed().as_secs()
                    ));
                }
                writer
                    .write_all(format!("# {} keepalive\r\n", config.software).as_bytes())
                    .await?;
            }
        }
    }
}

async fn handle_line(config: &AprsIsConfig, event_tx: &mpsc::Sender<RouterEvent>, line: &[u8]) {
    if line.first() == Some(&b'#') {
        let comment = String::from_utf8_lossy(line);
        let comment = comment.trim();
        if comment.contains("logresp") {
            info!("APRS-IS login response: {}", comment);
        } else {
            debug!("APRS-IS server comment: {}", comment);
        }
        return;
    }

    match parse_packet(line) {
        Ok(packet) => {
            debug!("RX [APRS-IS]: {}", packet);
            if config.rx_enable {
                let routed = RoutedPacket {
                    packet,
                    source: PacketSource::AprsIs,
                };
                let _ = event_tx.send(RouterEvent::Packet(routed)).await;
            }
        }
        Err(e) => debug!(
            "Unparseable APRS-IS line ({}): {}",
            e,
            String::from_utf8_lossy(line).trim()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> AprsIsConfig {
        let config = Config::parse(&format!(
            r#"
            server_call = "SRV"
            [aprsis]
            server = "127.0.0.1"
            port = {}
            callsign = "N0CALL-10"
            passcode = "-1"
            filter = "r/35/-106/100"
            "#,
            port
        ))
        .unwrap();
        config.aprsis.unwrap()
    }

    #[tokio::test]
    async fn test_login_line_and_rx() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"# test server\r\n").await.unwrap();

            let mut buf = [0u8; 512];
            let n = stream.read(&mut buf).await.unwrap();
            let login = String::from_utf8_lossy(&buf[..n]).to_string();

            stream
                .write_all(b"# logresp N0CALL-10 unverified, server TEST\r\n")
                .await
                .unwrap();
            stream
                .write_all(b"N1CALL>APRS:>from the internet\r\n")
                .await
                .unwrap();
            // Hold the socket open briefly so the client can read
            tokio::time::sleep(Duration::from_millis(100)).await;
            login
        });

        let config = test_config(port);
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (_is_tx, is_rx) = broadcast::channel::<AprsPacket>(8);

        let client = tokio::spawn(async move {
            let _ = connect_and_run(&config, &event_tx, is_rx).await;
        });

        let login = server.await.unwrap();
        // Passcode -1 is replaced by the computed one; filter is appended
        assert!(login.starts_with("user N0CALL-10 pass "));
        assert!(login.contains("vers aprsgate"));
        assert!(login.trim_end().ends_with("filter r/35/-106/100"));

        // Link state then the received packet
        let mut saw_connected = false;
        let mut saw_packet = false;
        while let Ok(Some(event)) =
            timeout(Duration::from_secs(1), event_rx.recv()).await
        {
            match event {
                RouterEvent::IsLink(LinkState::Connected) => saw_connected = true,
                RouterEvent::Packet(routed) => {
                    assert_eq!(routed.source, PacketSource::AprsIs);
                    assert_eq!(routed.packet.source.call, "N1CALL");
                    saw_packet = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_connected);
        assert!(saw_packet);
        client.abort();
    }

    #[tokio::test]
    async fn test_tx_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"# test server\r\n").await.unwrap();

            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).await.unwrap(); // login

            // Read until the outbound packet shows up
            let mut collected = String::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if collected.contains('\n') && collected.contains("N0CALL>") {
                    break;
                }
            }
            collected
        });

        let config = test_config(port);
        let (event_tx, _event_rx) = mpsc::channel(16);
        let (is_tx, is_rx) = broadcast::channel::<AprsPacket>(8);

        let client = tokio::spawn(async move {
            let _ = connect_and_run(&config, &event_tx, is_rx).await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let packet = parse_packet(b"N0CALL>APRS,qAR,GW:>outbound").unwrap();
        is_tx.send(packet).unwrap();

        let collected = timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(collected.contains("N0CALL>APRS,qAR,GW:>outbound\r\n"));
        client.abort();
    }
}
