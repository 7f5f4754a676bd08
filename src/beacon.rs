use crate::aprs::{AprsPacket, CallSign, PathElement};
use crate::config::BeaconConfig;
use crate::router::{PacketSource, RoutedPacket, RouterEvent};
use anyhow::Result;
use log::info;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// Periodic position beacon built from the configured fixed position; with
/// no position configured it falls back to a status packet.
pub struct BeaconService {
    config: BeaconConfig,
}

impl BeaconService {
    pub fn new(config: BeaconConfig) -> Self {
        BeaconService { config }
    }

    pub async fn run(self, tx: mpsc::Sender<RouterEvent>) -> Result<()> {
        info!(
            "Starting beacon service for {} every {}s",
            self.config.callsign, self.config.interval_s
        );

        let mut timer = interval(Duration::from_secs(self.config.interval_s));

        loop {
            timer.tick().await;

            let packet = self.build_packet();
            info!("Sending beacon: {}", packet);

            let routed = RoutedPacket {
                packet,
                source: PacketSource::Internal {
                    to_is: self.config.send_to_is,
                },
            };
            let _ = tx.send(RouterEvent::Packet(routed)).await;
        }
    }

    fn build_packet(&self) -> AprsPacket {
        let data = match (self.config.latitude, self.config.longitude) {
            (Some(lat), Some(lon)) => self.format_position(lat, lon),
            _ => format!(">{} no GPS fix", self.config.comment).trim_end().to_string(),
        };

        let source =
            CallSign::parse(&self.config.callsign).unwrap_or_else(|| CallSign::new("N0CALL", 0));
        let mut packet = AprsPacket::new(source, CallSign::new("APRS", 0), data.into_bytes());

        if !self.config.path.is_empty() {
            packet.path = self
                .config
                .path
                .split(',')
                .filter_map(|p| PathElement::parse(p.trim()))
                .collect();
        }

        packet
    }

    fn format_position(&self, lat: f64, lon: f64) -> String {
        let mut info = format!(
            "!{}{}{}{}",
            format_latitude(lat),
            self.config.symbol_table,
            format_longitude(lon),
            self.config.symbol
        );

        if !self.config.comment.is_empty() {
            info.push_str(&self.config.comment);
        }

        info
    }
}

fn format_latitude(lat: f64) -> String {
    let lat_abs = lat.abs();
    let degrees = lat_abs as u8;
    let minutes = (lat_abs - degrees as f64) * 60.0;
    let ns = if lat >= 0.0 { 'N' } else { 'S' };

    format!("{:02}{:05.2}{}", degrees, minutes, ns)
}

fn format_longitude(lon: f64) -> String {
    let lon_abs = lon.abs();
    let degrees = lon_abs as u16;
    let minutes = (lon_abs - degrees as f64) * 60.0;
    let ew = if lon >= 0.0 { 'E' } else { 'W' };

    format!("{:03}{:05.2}{}", degrees, minutes, ew)
}
