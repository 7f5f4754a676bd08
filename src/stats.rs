use crate::aprs::{AprsPacket, CallSign};
use crate::config::StatusConfig;
use crate::router::{PacketSource, RoutedPacket, RouterEvent};
use anyhow::Result;
use log::info;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Packet-plane counters. Incremented from the coordinator, read anywhere
/// through `snapshot`.
#[derive(Default)]
pub struct Stats {
    pub rf_rx: AtomicU64,
    pub rf_tx: AtomicU64,
    pub is_rx: AtomicU64,
    pub is_tx: AtomicU64,
    pub client_rx: AtomicU64,
    pub client_tx: AtomicU64,
    pub digipeated: AtomicU64,
    pub gated_to_rf: AtomicU64,
    pub gated_to_is: AtomicU64,
    pub duplicates: AtomicU64,
    pub parse_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub rf_rx: u64,
    pub rf_tx: u64,
    pub is_rx: u64,
    pub is_tx: u64,
    pub client_rx: u64,
    pub client_tx: u64,
    pub digipeated: u64,
    pub gated_to_rf: u64,
    pub gated_to_is: u64,
    pub duplicates: u64,
    pub parse_errors: u64,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rf_rx: self.rf_rx.load(Ordering::Relaxed),
            rf_tx: self.rf_tx.load(Ordering::Relaxed),
            is_rx: self.is_rx.load(Ordering::Relaxed),
            is_tx: self.is_tx.load(Ordering::Relaxed),
            client_rx: self.client_rx.load(Ordering::Relaxed),
            client_tx: self.client_tx.load(Ordering::Relaxed),
            digipeated: self.digipeated.load(Ordering::Relaxed),
            gated_to_rf: self.gated_to_rf.load(Ordering::Relaxed),
            gated_to_is: self.gated_to_is.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

/// Emits the gateway's counters as APRS telemetry, with PARM/UNIT label
/// lines every tenth report and an optional status line.
pub async fn run_status_reporter(
    config: StatusConfig,
    server_call: String,
    stats: Arc<Stats>,
    tx: mpsc::Sender<RouterEvent>,
) -> Result<()> {
    info!("Starting status reporter every {}s", config.interval_s);

    let mut timer = tokio::time::interval(tokio::time::Duration::from_secs(config.interval_s));
    let mut sequence = 0u32;
    let source = CallSign::parse(&server_call).unwrap_or_else(|| CallSign::new("N0CALL", 0));

    loop {
        timer.tick().await;

        let snap = stats.snapshot();
        let telemetry = format!(
            "T#{:03},{:03},{:03},{:03},{:03},{:03},00000000",
            sequence % 1000,
            (snap.rf_rx % 256) as u8,
            (snap.rf_tx % 256) as u8,
            (snap.digipeated % 256) as u8,
            (snap.gated_to_is % 256) as u8,
            (snap.gated_to_rf % 256) as u8
        );

        info!(
            "Stats: rf_rx={} rf_tx={} is_rx={} is_tx={} digi={} rf>is={} is>rf={}",
            snap.rf_rx,
            snap.rf_tx,
            snap.is_rx,
            snap.is_tx,
            snap.digipeated,
            snap.gated_to_is,
            snap.gated_to_rf
        );

        send_internal(&tx, &source, telemetry.into_bytes()).await;

        if sequence % 10 == 0 {
            let labels = format!(":{:<9}:PARM.RfRx,RfTx,Digi,RF>IS,IS>RF", source.to_string());
            send_internal(&tx, &source, labels.into_bytes()).await;

            let units = format!(":{:<9}:UNIT.Pkts,Pkts,Pkts,Pkts,Pkts", source.to_string());
            send_internal(&tx, &source, units.into_bytes()).await;
        }

        if !config.comment.is_empty() {
            let status = format!(">aprsgate {}", config.comment);
            send_internal(&tx, &source, status.into_bytes()).await;
        }

        sequence = sequence.wrapping_add(1);
    }
}

async fn send_internal(tx: &mpsc::Sender<RouterEvent>, source: &CallSign, data: Vec<u8>) {
    let packet = AprsPacket::new(source.clone(), CallSign::new("APRS", 0), data);
    let routed = RoutedPacket {
        packet,
        source: PacketSource::Internal { to_is: true },
    };
    let _ = tx.send(RouterEvent::Packet(routed)).await;
}
