use crate::acl::AccessControl;
use crate::aprs::{is_valid_callsign, parse_packet};
use crate::config::ServerConfig;
use crate::filter::{parse_filter, FilterSpec};
use crate::history::HistoryBuffer;
use crate::router::{PacketSource, RoutedPacket, RouterEvent};
use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

const AGENT: &str = concat!("aprsgate ", env!("CARGO_PKG_VERSION"));
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
const REPLAY_PACING: Duration = Duration::from_millis(10);
const OUTBOUND_QUEUE: usize = 64;
const MAX_PROTOCOL_ERRORS: u32 = 10;

/// A logged-in downstream session as the rest of the system sees it. The
/// sender feeds the per-client writer task; a full queue means the client
/// is too slow and gets dropped.
pub struct ClientHandle {
    pub id: u64,
    pub addr: SocketAddr,
    pub callsign: String,
    pub verified: bool,
    pub filters: Vec<FilterSpec>,
    pub sender: mpsc::Sender<Vec<u8>>,
    pub connected_at: Instant,
}

pub type ClientRegistry = Arc<RwLock<HashMap<u64, ClientHandle>>>;

#[derive(Debug, PartialEq)]
struct Login {
    callsign: String,
    passcode: String,
    software: String,
    version: String,
    filter: Option<String>,
}

/// Published APRS-IS passcode hash. Verification is advisory: it decides
/// qAC vs qAX tagging, never acceptance.
pub fn aprs_passcode(callsign: &str) -> i32 {
    let base = callsign.split('-').next().unwrap_or("").to_uppercase();
    let mut hash: i32 = 0x73e2;

    for (i, ch) in base.chars().enumerate() {
        if i % 2 == 0 {
            hash ^= (ch as i32) << 8;
        } else {
            hash ^= ch as i32;
        }
    }

    hash & 0x7fff
}

fn parse_login(line: &str) -> Option<Login> {
    let mut tokens = line.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("user") {
        return None;
    }
    let callsign = tokens.next()?.to_string();

    let mut passcode = None;
    let mut software = None;
    let mut version = None;
    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("pass") {
            passcode = Some(tokens.next()?.to_string());
        } else if token.eq_ignore_ascii_case("vers") {
            software = Some(tokens.next()?.to_string());
            version = Some(tokens.next()?.to_string());
        } else if token.eq_ignore_ascii_case("filter") {
            let rest: Vec<&str> = tokens.collect();
            return Some(Login {
                callsign,
                passcode: passcode?,
                software: software?,
                version: version?,
                filter: Some(rest.join(" ")),
            });
        }
    }

    Some(Login {
        callsign,
        passcode: passcode?,
        software: software?,
        version: version?,
        filter: None,
    })
}

/// Accepts downstream APRS-IS style clients and runs one task per session.
pub async fn run_server(
    config: ServerConfig,
    server_call: String,
    acl: Arc<RwLock<AccessControl>>,
    history: Arc<RwLock<HistoryBuffer>>,
    registry: ClientRegistry,
    event_tx: mpsc::Sender<RouterEvent>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("Client server listening on port {}", config.port);

    let next_id = Arc::new(AtomicU64::new(1));

    loop {
        let (stream, addr) = listener.accept().await?;

        if registry.read().await.len() >= config.max_clients {
            warn!("Rejecting {}: client limit reached", addr);
            continue;
        }
        if !acl.write().await.allow_connect(&addr.ip().to_string(), None) {
            debug!("Rejecting {}: access control", addr);
            continue;
        }

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            id,
            addr,
            server_call: server_call.clone(),
            replay_limit: config.replay_limit,
            acl: acl.clone(),
            history: history.clone(),
            registry: registry.clone(),
            event_tx: event_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = session.run(stream).await {
                debug!("Client session ended with error: {}", e);
            }
        });
    }
}

struct Session {
    id: u64,
    addr: SocketAddr,
    server_call: String,
    replay_limit: usize,
    acl: Arc<RwLock<AccessControl>>,
    history: Arc<RwLock<HistoryBuffer>>,
    registry: ClientRegistry,
    event_tx: mpsc::Sender<RouterEvent>,
}

impl Session {
    async fn run(self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("# {}\r\n", AGENT).as_bytes())
            .await?;

        // Login must arrive within the deadline
        let mut line = Vec::new();
        let n = timeout(LOGIN_TIMEOUT, reader.read_until(b'\n', &mut line)).await;
        let n = match n {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                info!("{} sent no login within deadline", self.addr);
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(());
        }

        let login_line = String::from_utf8_lossy(&line).trim().to_string();
        let Some(login) = parse_login(&login_line) else {
            write_half.write_all(b"# invalid login\r\n").await?;
            return Ok(());
        };

        if !is_valid_callsign(&login.callsign) {
            write_half
                .write_all(
                    format!(
                        "# logresp {} invalid, server {}\r\n",
                        login.callsign, self.server_call
                    )
                    .as_bytes(),
                )
                .await?;
            return Ok(());
        }
        let callsign = login.callsign.to_uppercase();

        if !self
            .acl
            .write()
            .await
            .allow_connect(&self.addr.ip().to_string(), Some(callsign.as_str()))
        {
            write_half.write_all(b"# access denied\r\n").await?;
            return Ok(());
        }

        let verified = login
            .passcode
            .parse::<i32>()
            .map(|p| p >= 0 && p == aprs_passcode(&callsign))
            .unwrap_or(false);

        write_half
            .write_all(
                format!(
                    "# logresp {} {}, server {}\r\n",
                    callsign,
                    if verified { "verified" } else { "unverified" },
                    self.server_call
                )
                .as_bytes(),
            )
            .await?;

        info!(
            "{} logged in as {} ({}) via {} {}",
            self.addr,
            callsign,
            if verified { "verified" } else { "unverified" },
            login.software,
            login.version
        );

        let filters = login
            .filter
            .as_deref()
            .map(parse_filter)
            .unwrap_or_default();

        let (sender, outbound) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        self.registry.write().await.insert(
            self.id,
            ClientHandle {
                id: self.id,
                addr: self.addr,
                callsign: callsign.clone(),
                verified,
                filters: filters.clone(),
                sender: sender.clone(),
                connected_at: Instant::now(),
            },
        );

        let writer = tokio::spawn(drain_outbound(outbound, write_half));

        // New sessions with a filter get recent matching history first
        if !filters.is_empty() {
            let replay = self
                .history
                .read()
                .await
                .query(&filters, None, self.replay_limit);
            debug!("Replaying {} packets to {}", replay.len(), callsign);
            for packet in replay {
                let mut line = packet.encode();
                line.extend_from_slice(b"\r\n");
                if sender.send(line).await.is_err() {
                    break;
                }
                tokio::time::sleep(REPLAY_PACING).await;
            }
        }

        let result = self
            .read_loop(&mut reader, &callsign, verified)
            .await;

        self.registry.write().await.remove(&self.id);
        self.acl.write().await.forget_client(self.id);
        writer.abort();
        info!("{} ({}) disconnected", self.addr, callsign);
        result
    }

    async fn read_loop(
        &self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        callsign: &str,
        verified: bool,
    ) -> Result<()> {
        let ip = self.addr.ip().to_string();
        let mut protocol_errors = 0u32;
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Ok(());
            }

            // Comment lines carry client commands (filter updates) or
            // keepalives; they are not packets.
            if line.first() == Some(&b'#') {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if let Some(expr) = strip_filter_command(&text) {
                    let filters = parse_filter(expr);
                    if let Some(client) = self.registry.write().await.get_mut(&self.id) {
                        client.filters = filters;
                    }
                    debug!("{} updated filter: {}", callsign, expr);
                }
                continue;
            }

            if !self
                .acl
                .write()
                .await
                .allow_send(self.id, &ip, callsign, n)
            {
                warn!("{} ({}) exceeded flood limits, disconnecting", callsign, ip);
                return Ok(());
            }

            match parse_packet(&line) {
                Ok(packet) => {
                    let routed = RoutedPacket {
                        packet,
                        source: PacketSource::Client {
                            id: self.id,
                            verified,
                        },
                    };
                    if self.event_tx.send(RouterEvent::Packet(routed)).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    debug!("Bad packet from {}: {}", callsign, e);
                    protocol_errors += 1;
                    if protocol_errors >= MAX_PROTOCOL_ERRORS {
                        warn!("{} sent {} bad lines, disconnecting", callsign, protocol_errors);
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn drain_outbound(mut outbound: mpsc::Receiver<Vec<u8>>, mut write_half: OwnedWriteHalf) {
    while let Some(line) = outbound.recv().await {
        if write_half.write_all(&line).await.is_err() {
            break;
        }
    }
}

fn strip_filter_command(text: &str) -> Option<&str> {
    let rest = text.strip_prefix('#')?.trim_start();
    let rest = rest
        .strip_prefix("filter")
        .or_else(|| rest.strip_prefix("FILTER"))?;
    Some(rest.trim())
}
