use crate::aprs::AprsPacket;
use crate::config::Config;
use crate::dedup::DuplicateFilter;
use crate::digipeater::{DigiDecision, Digipeater};
use crate::gate::RfGate;
use crate::history::HistoryBuffer;
use crate::qcon;
use crate::server::ClientRegistry;
use crate::stats::Stats;
use anyhow::Result;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const VISCOUS_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub enum PacketSource {
    Rf(String),
    AprsIs,
    Peer(String),
    Client { id: u64, verified: bool },
    Udp,
    Internal { to_is: bool },
}

#[derive(Debug, Clone)]
pub struct RoutedPacket {
    pub packet: AprsPacket,
    pub source: PacketSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub enum RouterEvent {
    Packet(RoutedPacket),
    IsLink(LinkState),
}

pub struct RouterChannels {
    pub rf_tx: broadcast::Sender<AprsPacket>,
    pub is_tx: broadcast::Sender<AprsPacket>,
    pub peer_tx: broadcast::Sender<AprsPacket>,
}

/// The coordinator. Owns the duplicate filter, digipeater and RF gate,
/// runs the per-direction pipelines, and fans admitted packets out to the
/// transmit channels, history and downstream clients.
pub struct Router {
    server_call: String,
    dedup: DuplicateFilter,
    digipeater: Digipeater,
    gate: RfGate,
    history: Arc<RwLock<HistoryBuffer>>,
    clients: ClientRegistry,
    stats: Arc<Stats>,
    rx: mpsc::Receiver<RouterEvent>,
    rf_tx: broadcast::Sender<AprsPacket>,
    is_tx: broadcast::Sender<AprsPacket>,
    peer_tx: broadcast::Sender<AprsPacket>,
}

impl Router {
    pub fn new(
        config: &Config,
        rx: mpsc::Receiver<RouterEvent>,
        history: Arc<RwLock<HistoryBuffer>>,
        clients: ClientRegistry,
        stats: Arc<Stats>,
    ) -> (Self, RouterChannels) {
        let (rf_tx, _) = broadcast::channel(100);
        let (is_tx, _) = broadcast::channel(100);
        let (peer_tx, _) = broadcast::channel(100);

        let channels = RouterChannels {
            rf_tx: rf_tx.clone(),
            is_tx: is_tx.clone(),
            peer_tx: peer_tx.clone(),
        };

        let own_gate_call = config
            .aprsis
            .as_ref()
            .map(|c| c.callsign.clone())
            .unwrap_or_else(|| config.server_call.clone());

        let router = Router {
            server_call: config.server_call.clone(),
            dedup: DuplicateFilter::new(Duration::from_millis(config.dedup_window_ms)),
            digipeater: Digipeater::new(config.digipeater.clone()),
            gate: RfGate::new(config.gate.clone(), own_gate_call),
            history,
            clients,
            stats,
            rx,
            rf_tx,
            is_tx,
            peer_tx,
        };

        (router, channels)
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Starting packet router");

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut viscous = tokio::time::interval(VISCOUS_TICK);

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(RouterEvent::Packet(routed)) => self.handle_packet(routed).await,
                        Some(RouterEvent::IsLink(state)) => {
                            info!("APRS-IS link: {:?}", state);
                        }
                        None => {
                            info!("Router channel closed, stopping");
                            return Ok(());
                        }
                    }
                }
                _ = viscous.tick() => {
                    for packet in self.digipeater.take_due() {
                        self.transmit_rf(packet);
                        self.stats.bump(&self.stats.digipeated);
                    }
                }
                _ = sweep.tick() => {
                    self.dedup.sweep();
                    self.digipeater.sweep();
                    self.gate.sweep();
                }
            }
        }
    }

    async fn handle_packet(&mut self, routed: RoutedPacket) {
        let RoutedPacket { mut packet, source } = routed;

        match &source {
            PacketSource::Rf(_) => self.stats.bump(&self.stats.rf_rx),
            PacketSource::AprsIs | PacketSource::Peer(_) => self.stats.bump(&self.stats.is_rx),
            PacketSource::Client { .. } | PacketSource::Udp => {
                self.stats.bump(&self.stats.client_rx)
            }
            PacketSource::Internal { .. } => {}
        }

        if self.dedup.is_duplicate(&packet) {
            self.stats.bump(&self.stats.duplicates);
            debug!("Dropping duplicate: {}", packet);
            return;
        }
        self.dedup.record(&packet);

        match source {
            PacketSource::Rf(ref name) => {
                self.gate.note_rf_heard(&packet);

                match self.digipeater.decide(&packet) {
                    DigiDecision::Digipeat(out) => {
                        info!("Digipeating [{}]: {}", name, out);
                        self.transmit_rf(out);
                        self.stats.bump(&self.stats.digipeated);
                    }
                    DigiDecision::Defer(delay) => {
                        debug!("Viscous hold {:?}: {}", delay, packet);
                    }
                    DigiDecision::Drop(reason) => {
                        debug!("Not digipeating ({:?}): {}", reason, packet);
                    }
                }

                let admitted = match self.gate.check_rf_to_is(&packet) {
                    Ok(gated) => {
                        info!("Gating to APRS-IS: {}", gated);
                        self.transmit_is(gated.clone());
                        self.stats.bump(&self.stats.gated_to_is);
                        gated
                    }
                    Err(reason) => {
                        debug!("Not gating to IS ({:?}): {}", reason, packet);
                        packet
                    }
                };
                let _ = self.peer_tx.send(admitted.clone());
                self.admit(admitted, None).await;
            }
            PacketSource::AprsIs => {
                if let Ok(prepared) = self.gate.check_is_to_rf(&packet) {
                    info!("Gating to RF: {}", prepared);
                    self.transmit_rf(prepared);
                    self.stats.bump(&self.stats.gated_to_rf);
                }
                let _ = self.peer_tx.send(packet.clone());
                self.admit(packet, None).await;
            }
            PacketSource::Peer(_) => {
                // Peer traffic is Internet-tier: eligible for RF gating and
                // local fan-out, but never echoed back to the peer mesh
                if let Ok(prepared) = self.gate.check_is_to_rf(&packet) {
                    info!("Gating to RF: {}", prepared);
                    self.transmit_rf(prepared);
                    self.stats.bump(&self.stats.gated_to_rf);
                }
                self.admit(packet, None).await;
            }
            PacketSource::Client { id, verified } => {
                qcon::append_client_construct(&mut packet, verified, &self.server_call);
                self.transmit_is(packet.clone());
                let _ = self.peer_tx.send(packet.clone());
                self.admit(packet, Some(id)).await;
            }
            PacketSource::Udp => {
                // Submitters never log in, so their packets are unverified
                qcon::append_client_construct(&mut packet, false, &self.server_call);
                self.transmit_is(packet.clone());
                let _ = self.peer_tx.send(packet.clone());
                self.admit(packet, None).await;
            }
            PacketSource::Internal { to_is } => {
                self.transmit_rf(packet.clone());
                if to_is {
                    self.transmit_is(packet.clone());
                }
                let _ = self.peer_tx.send(packet.clone());
                self.admit(packet, None).await;
            }
        }
    }

    /// Appends an admitted packet to history and broadcasts it to matching
    /// downstream clients, excluding the submitting session.
    async fn admit(&mut self, packet: AprsPacket, exclude: Option<u64>) {
        self.history.write().await.record(packet.clone());

        let mut line = packet.encode();
        line.extend_from_slice(b"\r\n");

        let mut overflowed = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, client) in clients.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                if !crate::filter::matches_any(&client.filters, &packet) {
                    continue;
                }
                if client.sender.try_send(line.clone()).is_err() {
                    overflowed.push(*id);
                } else {
                    self.stats.bump(&self.stats.client_tx);
                }
            }
        }

        if !overflowed.is_empty() {
            let mut clients = self.clients.write().await;
            for id in overflowed {
                info!("Disconnecting client {} (write queue full)", id);
                clients.remove(&id);
            }
        }
    }

    fn transmit_rf(&self, packet: AprsPacket) {
        if self.rf_tx.send(packet).is_ok() {
            self.stats.bump(&self.stats.rf_tx);
        }
    }

    fn transmit_is(&self, packet: AprsPacket) {
        if self.is_tx.send(packet).is_ok() {
            self.stats.bump(&self.stats.is_tx);
        }
    }
}
