use crate::aprs::{extract_position, haversine_km, AprsPacket, PacketType};
use crate::config::{GateConfig, IsToRfPolicy};
use crate::dedup::packet_key;
use crate::qcon;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReject {
    Disabled,
    Duplicate,
    InvalidPath,
    ThirdParty,
    OutOfRange,
    FilteredType,
    NotHeard,
    RateLimited,
    MaxHops,
}

/// Policy engine for RF→IS and IS→RF forwarding, with heard-station
/// tracking and an IS→RF rate limit.
pub struct RfGate {
    config: GateConfig,
    own_call: String,
    rf_to_is_recent: HashMap<String, Instant>,
    is_to_rf_recent: HashMap<String, Instant>,
    rf_emissions: VecDeque<Instant>,
    heard_direct: HashMap<String, Instant>,
    heard_indirect: HashMap<String, Instant>,
}

impl RfGate {
    pub fn new(config: GateConfig, own_call: String) -> Self {
        RfGate {
            config,
            own_call,
            rf_to_is_recent: HashMap::new(),
            is_to_rf_recent: HashMap::new(),
            rf_emissions: VecDeque::new(),
            heard_direct: HashMap::new(),
            heard_indirect: HashMap::new(),
        }
    }

    /// Updates the heard set from an RF reception. Direct means nobody has
    /// digipeated the packet yet (no used hops).
    pub fn note_rf_heard(&mut self, packet: &AprsPacket) {
        let call = packet.source.to_string();
        let direct = !packet.path.iter().any(|hop| hop.used);
        if direct {
            self.heard_direct.insert(call, Instant::now());
        } else {
            self.heard_indirect.insert(call, Instant::now());
        }
    }

    pub fn is_heard(&self, call: &str) -> bool {
        let window = self.heard_window();
        let fresh = |seen: &Instant| seen.elapsed() <= window;
        self.heard_direct.get(call).map_or(false, fresh)
            || self.heard_indirect.get(call).map_or(false, fresh)
    }

    /// RF→IS check. On success returns the packet with `qAR,<own>` appended.
    pub fn check_rf_to_is(&mut self, packet: &AprsPacket) -> Result<AprsPacket, GateReject> {
        if !self.config.rf_to_is {
            return Err(GateReject::Disabled);
        }

        let key = packet_key(packet);
        if self.fresh(&self.rf_to_is_recent, &key) {
            return Err(GateReject::Duplicate);
        }

        let bad_path = packet.path.iter().any(|hop| {
            hop.is_q_construct() || hop.is_tcpip() || hop.is_nogate() || hop.is_rfonly()
        });
        if bad_path {
            return Err(GateReject::InvalidPath);
        }

        if packet.is_third_party() {
            return Err(GateReject::ThirdParty);
        }

        if self.config.gate_local_only {
            if let (Some(station), Some(pos)) = (self.station_position(), extract_position(packet))
            {
                let distance = haversine_km(station.0, station.1, pos.latitude, pos.longitude);
                if distance > self.config.local_range_km {
                    debug!("{} is {:.1} km away, not gating", packet.source, distance);
                    return Err(GateReject::OutOfRange);
                }
            }
            // Packets without a position are treated as local
        }

        if !self.type_allowed(packet.packet_type) {
            return Err(GateReject::FilteredType);
        }

        let mut gated = packet.clone();
        qcon::append_gate_construct(&mut gated, &self.own_call);
        self.rf_to_is_recent.insert(key, Instant::now());
        Ok(gated)
    }

    /// IS→RF check. On success returns the packet with Internet-side path
    /// elements stripped.
    pub fn check_is_to_rf(&mut self, packet: &AprsPacket) -> Result<AprsPacket, GateReject> {
        if !self.config.is_to_rf {
            return Err(GateReject::Disabled);
        }

        let key = packet_key(packet);
        if self.fresh(&self.is_to_rf_recent, &key) {
            return Err(GateReject::Duplicate);
        }

        while let Some(at) = self.rf_emissions.front() {
            if at.elapsed() > RATE_WINDOW {
                self.rf_emissions.pop_front();
            } else {
                break;
            }
        }
        if self.rf_emissions.len() >= self.config.max_rf_rate as usize {
            return Err(GateReject::RateLimited);
        }

        if !self.reachable(packet) {
            return Err(GateReject::NotHeard);
        }

        let mut prepared = packet.clone();
        qcon::strip_for_rf(&mut prepared);

        let budget: u32 = prepared
            .path
            .iter()
            .filter(|hop| !hop.used)
            .map(|hop| match hop.wide_hops().or_else(|| hop.trace_hops()) {
                Some((_, remaining)) => remaining as u32,
                None => 1,
            })
            .sum();
        if budget > self.config.max_hops_to_rf as u32 {
            return Err(GateReject::MaxHops);
        }

        self.is_to_rf_recent.insert(key, Instant::now());
        self.rf_emissions.push_back(Instant::now());
        Ok(prepared)
    }

    pub fn sweep(&mut self) {
        let dedup = self.dedup_window();
        self.rf_to_is_recent.retain(|_, seen| seen.elapsed() <= dedup);
        self.is_to_rf_recent.retain(|_, seen| seen.elapsed() <= dedup);

        let heard = self.heard_window();
        self.heard_direct.retain(|_, seen| seen.elapsed() <= heard);
        self.heard_indirect.retain(|_, seen| seen.elapsed() <= heard);

        while let Some(at) = self.rf_emissions.front() {
            if at.elapsed() > RATE_WINDOW {
                self.rf_emissions.pop_front();
            } else {
                break;
            }
        }
    }

    fn reachable(&self, packet: &AprsPacket) -> bool {
        match self.config.is_to_rf_type {
            IsToRfPolicy::All => true,
            IsToRfPolicy::MessageOnly => {
                packet.data.first() == Some(&b':')
                    || packet
                        .message_addressee()
                        .is_some_and(|a| self.is_heard(&a))
            }
            IsToRfPolicy::Heard => {
                self.is_heard(&packet.source.to_string())
                    || self.is_heard(&packet.destination.to_string())
                    || packet
                        .message_addressee()
                        .is_some_and(|a| self.is_heard(&a))
            }
        }
    }

    fn type_allowed(&self, packet_type: PacketType) -> bool {
        match packet_type {
            PacketType::Message | PacketType::Bulletin => self.config.gate_messages,
            t if t.is_position() => self.config.gate_positions,
            PacketType::Weather => self.config.gate_weather,
            PacketType::Telemetry => self.config.gate_telemetry,
            PacketType::Object | PacketType::Item => self.config.gate_objects,
            _ => true,
        }
    }

    fn fresh(&self, map: &HashMap<String, Instant>, key: &str) -> bool {
        map.get(key)
            .is_some_and(|seen| seen.elapsed() <= self.dedup_window())
    }

    fn station_position(&self) -> Option<(f64, f64)> {
        match (self.config.latitude, self.config.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.config.dedup_window_ms)
    }

    fn heard_window(&self) -> Duration {
        Duration::from_secs(self.config.heard_window_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aprs::{CallSign, PathElement};
    use assert_matches::assert_matches;

    fn test_config() -> GateConfig {
        GateConfig {
            rf_to_is: true,
            is_to_rf: true,
            is_to_rf_type: IsToRfPolicy::All,
            gate_local_only: false,
            local_range_km: 50.0,
            max_rf_rate: 5,
            max_hops_to_rf: 2,
            gate_messages: true,
            gate_positions: true,
            gate_weather: true,
            gate_telemetry: true,
            gate_objects: true,
            dedup_window_ms: 30_000,
            heard_window_s: 600,
            latitude: Some(35.9),
            longitude: Some(-106.0),
        }
    }

    fn gate() -> RfGate {
        RfGate::new(test_config(), "GW-10".to_string())
    }

    fn packet_with_path(source: &str, data: &[u8], path: &[&str]) -> AprsPacket {
        let mut p = AprsPacket::new(
            CallSign::parse(source).unwrap(),
            CallSign::new("APRS", 0),
            data.to_vec(),
        );
        p.path = path
            .iter()
            .map(|s| PathElement::parse(s).unwrap())
            .collect();
        p
    }

    fn path_of(packet: &AprsPacket) -> Vec<String> {
        packet.path.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_rf_to_is_appends_qar() {
        let mut gate = gate();
        let p = packet_with_path("N0CALL", b">Test", &["WIDE1*"]);

        let gated = gate.check_rf_to_is(&p).unwrap();
        assert_eq!(path_of(&gated), vec!["WIDE1*", "qAR", "GW-10"]);
    }

    #[test]
    fn test_rf_to_is_duplicate() {
        let mut gate = gate();
        let p = packet_with_path("N0CALL", b">Test", &[]);

        assert!(gate.check_rf_to_is(&p).is_ok());
        assert_matches!(gate.check_rf_to_is(&p), Err(GateReject::Duplicate));
    }

    #[test]
    fn test_rf_to_is_path_hygiene() {
        let mut gate = gate();

        for path in [&["NOGATE"][..], &["RFONLY"], &["TCPIP*"], &["qAR", "X1Y"]] {
            let p = packet_with_path("N0CALL", b">Test", path);
            assert_matches!(gate.check_rf_to_is(&p), Err(GateReject::InvalidPath));
        }
    }

    #[test]
    fn test_rf_to_is_third_party() {
        let mut gate = gate();
        let p = packet_with_path("N0CALL", b"}A>B:x", &[]);
        assert_matches!(gate.check_rf_to_is(&p), Err(GateReject::ThirdParty));
    }

    #[test]
    fn test_rf_to_is_local_range() {
        let mut config = test_config();
        config.gate_local_only = true;
        let mut gate = RfGate::new(config, "GW-10".to_string());

        // ~16 km from the station position
        let near = packet_with_path("N0CALL", b"!3553.50N/10602.50W>", &[]);
        assert!(gate.check_rf_to_is(&near).is_ok());

        let far = packet_with_path("N1CALL", b"!4903.50N/07201.75W>", &[]);
        assert_matches!(gate.check_rf_to_is(&far), Err(GateReject::OutOfRange));

        // No position: treated as local
        let status = packet_with_path("N2CALL", b">no position", &[]);
        assert!(gate.check_rf_to_is(&status).is_ok());
    }

    #[test]
    fn test_rf_to_is_type_filter() {
        let mut config = test_config();
        config.gate_weather = false;
        let mut gate = RfGate::new(config, "GW-10".to_string());

        let wx = packet_with_path("N0CALL", b"_10090556c220s004g005t077", &[]);
        assert_matches!(gate.check_rf_to_is(&wx), Err(GateReject::FilteredType));

        let pos = packet_with_path("N0CALL", b"!3553.50N/10602.50W>", &[]);
        assert!(gate.check_rf_to_is(&pos).is_ok());
    }

    #[test]
    fn test_rf_to_is_disabled() {
        let mut config = test_config();
        config.rf_to_is = false;
        let mut gate = RfGate::new(config, "GW-10".to_string());

        let p = packet_with_path("N0CALL", b">Test", &[]);
        assert_matches!(gate.check_rf_to_is(&p), Err(GateReject::Disabled));
    }

    #[test]
    fn test_is_to_rf_strips_internet_path() {
        let mut gate = gate();
        gate.note_rf_heard(&packet_with_path("K0DST", b">here", &[]));

        let p = packet_with_path("N0CALL", b">Test", &["WIDE2-1", "qAC", "SRV"]);
        let prepared = gate.check_is_to_rf(&p).unwrap();
        assert_eq!(path_of(&prepared), vec!["WIDE2-1"]);
    }

    #[test]
    fn test_is_to_rf_rate_limit() {
        let mut config = test_config();
        config.max_rf_rate = 2;
        let mut gate = RfGate::new(config, "GW-10".to_string());

        for i in 0..2 {
            let p = packet_with_path("N0CALL", format!(">T{}", i).as_bytes(), &[]);
            assert!(gate.check_is_to_rf(&p).is_ok());
        }
        let p = packet_with_path("N0CALL", b">T9", &[]);
        assert_matches!(gate.check_is_to_rf(&p), Err(GateReject::RateLimited));
    }

    #[test]
    fn test_is_to_rf_hop_budget() {
        let mut gate = gate();

        let p = packet_with_path("N0CALL", b">Test", &["WIDE3-3"]);
        assert_matches!(gate.check_is_to_rf(&p), Err(GateReject::MaxHops));

        let p = packet_with_path("N0CALL", b">Test2", &["WIDE2-2"]);
        assert!(gate.check_is_to_rf(&p).is_ok());

        // Used hops do not count against the budget
        let p = packet_with_path("N0CALL", b">Test3", &["DIGI*", "GW*", "WIDE1-1"]);
        assert!(gate.check_is_to_rf(&p).is_ok());
    }

    #[test]
    fn test_is_to_rf_heard_policy() {
        let mut config = test_config();
        config.is_to_rf_type = IsToRfPolicy::Heard;
        let mut gate = RfGate::new(config, "GW-10".to_string());

        let p = packet_with_path("N0CALL", b">Test", &[]);
        assert_matches!(gate.check_is_to_rf(&p), Err(GateReject::NotHeard));

        gate.note_rf_heard(&packet_with_path("N0CALL", b">rf", &[]));
        assert!(gate.check_is_to_rf(&p).is_ok());

        // Message addressee counts too
        let msg = packet_with_path("W9XYZ", b":N0CALL   :hello", &[]);
        assert!(gate.check_is_to_rf(&msg).is_ok());
    }

    #[test]
    fn test_is_to_rf_message_only_policy() {
        let mut config = test_config();
        config.is_to_rf_type = IsToRfPolicy::MessageOnly;
        let mut gate = RfGate::new(config, "GW-10".to_string());

        let status = packet_with_path("N0CALL", b">Test", &[]);
        assert_matches!(gate.check_is_to_rf(&status), Err(GateReject::NotHeard));

        let msg = packet_with_path("N0CALL", b":K0ABC    :hello", &[]);
        assert!(gate.check_is_to_rf(&msg).is_ok());
    }

    #[test]
    fn test_heard_direct_vs_indirect() {
        let mut gate = gate();

        gate.note_rf_heard(&packet_with_path("N0CALL", b">x", &[]));
        assert!(gate.heard_direct.contains_key("N0CALL"));

        gate.note_rf_heard(&packet_with_path("N1CALL", b">x", &["DIGI*", "WIDE1-1"]));
        assert!(gate.heard_indirect.contains_key("N1CALL"));
        assert!(gate.is_heard("N0CALL"));
        assert!(gate.is_heard("N1CALL"));
        assert!(!gate.is_heard("N2CALL"));
    }

    #[test]
    fn test_heard_expiry() {
        let mut gate = gate();
        gate.heard_direct
            .insert("N0CALL".to_string(), Instant::now() - Duration::from_secs(601));

        assert!(!gate.is_heard("N0CALL"));
        gate.sweep();
        assert!(gate.heard_direct.is_empty());
    }
}
