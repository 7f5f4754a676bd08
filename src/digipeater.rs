use crate::aprs::{AprsPacket, CallSign, PathElement};
use crate::config::DigipeaterConfig;
use crate::dedup::packet_key;
use log::{debug, info};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of a digipeat decision. `Defer` means the rewrite was queued
/// under viscous delay and will surface from `take_due` unless a second
/// copy cancels it first.
#[derive(Debug, Clone, PartialEq)]
pub enum DigiDecision {
    Digipeat(AprsPacket),
    Defer(Duration),
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Disabled,
    Duplicate,
    Flooding,
    Acl,
    FilteredType,
    NoMatch,
    MaxHopsExceeded,
}

struct RecentEntry {
    seen: Instant,
    source: String,
}

struct ViscousEntry {
    packet: AprsPacket,
    queued_at: Instant,
}

pub struct Digipeater {
    config: DigipeaterConfig,
    own_call: String,
    recent: HashMap<String, RecentEntry>,
    viscous: HashMap<String, ViscousEntry>,
}

impl Digipeater {
    pub fn new(config: DigipeaterConfig) -> Self {
        let own_call = CallSign::new(&config.callsign, config.ssid).to_string();
        Digipeater {
            config,
            own_call,
            recent: HashMap::new(),
            viscous: HashMap::new(),
        }
    }

    /// Runs the decision pipeline for one RF packet, short-circuiting on the
    /// first failing check.
    pub fn decide(&mut self, packet: &AprsPacket) -> DigiDecision {
        if !self.config.enabled {
            return DigiDecision::Drop(DropReason::Disabled);
        }

        let key = packet_key(packet);

        // A second copy within the viscous delay means another digi already
        // handled it; cancel the queued emission and remember the content
        // so later copies drop as duplicates.
        if self.viscous.remove(&key).is_some() {
            debug!("viscous cancel: {}", packet);
            self.remember(&key, packet);
            return DigiDecision::Drop(DropReason::Duplicate);
        }

        if let Some(entry) = self.recent.get(&key) {
            if entry.seen.elapsed() <= self.dedup_window() {
                return DigiDecision::Drop(DropReason::Duplicate);
            }
        }

        if self.source_flooding(packet) {
            return DigiDecision::Drop(DropReason::Flooding);
        }

        if !self.source_allowed(packet) {
            return DigiDecision::Drop(DropReason::Acl);
        }

        if self.type_filtered(packet) {
            return DigiDecision::Drop(DropReason::FilteredType);
        }

        let rewritten = match self.rewrite(packet) {
            Ok(rewritten) => rewritten,
            Err(reason) => return DigiDecision::Drop(reason),
        };

        if self.config.viscous_delay_ms > 0 && packet.packet_type.is_position() {
            let delay = Duration::from_millis(self.config.viscous_delay_ms);
            self.viscous.insert(
                key,
                ViscousEntry {
                    packet: rewritten,
                    queued_at: Instant::now(),
                },
            );
            return DigiDecision::Defer(delay);
        }

        self.remember(&key, packet);
        DigiDecision::Digipeat(rewritten)
    }

    /// Viscous-queue entries whose delay has elapsed, ready to transmit.
    pub fn take_due(&mut self) -> Vec<AprsPacket> {
        let delay = Duration::from_millis(self.config.viscous_delay_ms);
        let due: Vec<String> = self
            .viscous
            .iter()
            .filter(|(_, entry)| entry.queued_at.elapsed() >= delay)
            .map(|(key, _)| key.clone())
            .collect();

        let mut packets = Vec::with_capacity(due.len());
        for key in due {
            if let Some(entry) = self.viscous.remove(&key) {
                info!("viscous delay elapsed, digipeating: {}", entry.packet);
                self.recent.insert(
                    key,
                    RecentEntry {
                        seen: Instant::now(),
                        source: entry.packet.source.to_string(),
                    },
                );
                packets.push(entry.packet);
            }
        }
        packets
    }

    pub fn sweep(&mut self) {
        let horizon = self.dedup_window().max(self.flood_window());
        self.recent.retain(|_, entry| entry.seen.elapsed() <= horizon);
        debug!("digipeater sweep, {} recent entries", self.recent.len());
    }

    fn remember(&mut self, key: &str, packet: &AprsPacket) {
        self.recent.insert(
            key.to_string(),
            RecentEntry {
                seen: Instant::now(),
                source: packet.source.to_string(),
            },
        );
    }

    fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.config.dedup_window_ms)
    }

    fn flood_window(&self) -> Duration {
        Duration::from_millis(self.config.flood_window_ms)
    }

    fn source_flooding(&self, packet: &AprsPacket) -> bool {
        let source = packet.source.to_string();
        let window = self.flood_window();
        let count = self
            .recent
            .values()
            .filter(|entry| entry.source == source && entry.seen.elapsed() <= window)
            .count();
        count > self.config.max_flood_rate as usize
    }

    fn source_allowed(&self, packet: &AprsPacket) -> bool {
        let source = packet.source.to_string();
        if self
            .config
            .blacklist
            .iter()
            .any(|b| b.eq_ignore_ascii_case(&source))
        {
            return false;
        }
        if !self.config.whitelist.is_empty()
            && !self
                .config
                .whitelist
                .iter()
                .any(|w| w.eq_ignore_ascii_case(&source))
        {
            return false;
        }
        true
    }

    fn type_filtered(&self, packet: &AprsPacket) -> bool {
        use crate::aprs::PacketType;
        match packet.packet_type {
            PacketType::Weather => self.config.filter_weather,
            PacketType::Telemetry => self.config.filter_telemetry,
            _ => false,
        }
    }

    /// Rewrites the path at the first unused hop. Only that hop is
    /// considered; a non-matching element ends the search.
    fn rewrite(&self, packet: &AprsPacket) -> Result<AprsPacket, DropReason> {
        let index = packet
            .path
            .iter()
            .position(|hop| !hop.used)
            .ok_or(DropReason::NoMatch)?;

        let hop = &packet.path[index];
        let mut new_packet = packet.clone();

        if hop.element == self.own_call
            || self
                .config
                .aliases
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&hop.element))
        {
            new_packet.path[index] = PathElement::used(&self.own_call);
        } else if self.config.fill_in {
            // Fill-in digis answer WIDE1-1 and nothing else
            if hop.element == "WIDE1-1" {
                new_packet.path[index] = PathElement::used("WIDE1");
                new_packet
                    .path
                    .insert(index, PathElement::used(&self.own_call));
            } else {
                return Err(DropReason::NoMatch);
            }
        } else if let Some((n, remaining)) = hop.wide_hops() {
            if !(1..=7).contains(&n) || remaining < 1 || remaining > n {
                return Err(DropReason::NoMatch);
            }
            if n > self.config.max_hops {
                return Err(DropReason::MaxHopsExceeded);
            }
            let consumed = decrement_flood("WIDE", n, remaining);
            new_packet.path[index] = consumed;
            if self.config.preemptive {
                new_packet
                    .path
                    .insert(index, PathElement::used(&self.own_call));
            }
        } else if let Some((n, remaining)) = hop.trace_hops() {
            if !(1..=7).contains(&n) || remaining < 1 || remaining > n {
                return Err(DropReason::NoMatch);
            }
            if n > self.config.max_hops {
                return Err(DropReason::MaxHopsExceeded);
            }
            new_packet.path[index] = decrement_flood("TRACE", n, remaining);
            new_packet
                .path
                .insert(index, PathElement::used(&self.own_call));
        } else {
            return Err(DropReason::NoMatch);
        }

        if new_packet.used_hops() > self.config.max_hops as usize {
            return Err(DropReason::MaxHopsExceeded);
        }

        Ok(new_packet)
    }
}

/// `WIDEn-N` with N > 1 decrements; N = 1 consumes the element entirely and
/// marks it used.
fn decrement_flood(family: &str, n: u8, remaining: u8) -> PathElement {
    if remaining > 1 {
        PathElement::new(&format!("{}{}-{}", family, n, remaining - 1))
    } else {
        PathElement::used(&format!("{}{}", family, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aprs::CallSign;
    use assert_matches::assert_matches;

    fn test_config() -> DigipeaterConfig {
        DigipeaterConfig {
            enabled: true,
            callsign: "DIGI".to_string(),
            ssid: 0,
            aliases: vec!["RELAY".to_string()],
            max_hops: 2,
            dedup_window_ms: 30_000,
            flood_window_ms: 60_000,
            max_flood_rate: 3,
            viscous_delay_ms: 0,
            fill_in: false,
            preemptive: false,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            filter_weather: false,
            filter_telemetry: false,
        }
    }

    fn packet_with_path(data: &[u8], path: &[&str]) -> AprsPacket {
        let mut p = AprsPacket::new(
            CallSign::new("N0CALL", 0),
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
    fn test_disabled() {
        let mut config = test_config();
        config.enabled = false;
        let mut digi = Digipeater::new(config);

        let p = packet_with_path(b">Test", &["WIDE1-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::Disabled));
    }

    #[test]
    fn test_wide_decrement() {
        let mut digi = Digipeater::new(test_config());

        let p = packet_with_path(b">Test", &["WIDE2-2"]);
        let decision = digi.decide(&p);
        let DigiDecision::Digipeat(out) = decision else {
            panic!("expected digipeat, got {:?}", decision);
        };
        assert_eq!(path_of(&out), vec!["WIDE2-1"]);

        // Identical content within the dedup window drops
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::Duplicate));
    }

    #[test]
    fn test_wide_last_hop_consumed() {
        let mut digi = Digipeater::new(test_config());

        let p = packet_with_path(b">Test", &["WIDE2-1"]);
        let DigiDecision::Digipeat(out) = digi.decide(&p) else {
            panic!("expected digipeat");
        };
        assert_eq!(path_of(&out), vec!["WIDE2*"]);
        assert_eq!(out.used_hops(), 1);
    }

    #[test]
    fn test_direct_call_match() {
        let mut digi = Digipeater::new(test_config());

        let p = packet_with_path(b">Test", &["DIGI"]);
        let DigiDecision::Digipeat(out) = digi.decide(&p) else {
            panic!("expected digipeat");
        };
        assert_eq!(path_of(&out), vec!["DIGI*"]);
    }

    #[test]
    fn test_alias_match() {
        let mut digi = Digipeater::new(test_config());

        let p = packet_with_path(b">Test", &["RELAY", "WIDE2-1"]);
        let DigiDecision::Digipeat(out) = digi.decide(&p) else {
            panic!("expected digipeat");
        };
        assert_eq!(path_of(&out), vec!["DIGI*", "WIDE2-1"]);
    }

    #[test]
    fn test_first_unused_hop_decides() {
        let mut digi = Digipeater::new(test_config());

        // First unused hop is someone else's callsign
        let p = packet_with_path(b">Test", &["OTHER-1", "WIDE2-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::NoMatch));

        // Used hops are skipped before the match
        let p = packet_with_path(b">Test2", &["OTHER-1*", "WIDE2-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Digipeat(_));
    }

    #[test]
    fn test_no_unused_hops() {
        let mut digi = Digipeater::new(test_config());

        let p = packet_with_path(b">Test", &["DIGI*", "WIDE1*"]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::NoMatch));

        let p = packet_with_path(b">Test2", &[]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::NoMatch));
    }

    #[test]
    fn test_trace_inserts_own_call() {
        let mut digi = Digipeater::new(test_config());

        let p = packet_with_path(b">Test", &["TRACE2-2"]);
        let DigiDecision::Digipeat(out) = digi.decide(&p) else {
            panic!("expected digipeat");
        };
        assert_eq!(path_of(&out), vec!["DIGI*", "TRACE2-1"]);

        let p = packet_with_path(b">Test2", &["TRACE2-1"]);
        let DigiDecision::Digipeat(out) = digi.decide(&p) else {
            panic!("expected digipeat");
        };
        assert_eq!(path_of(&out), vec!["DIGI*", "TRACE2*"]);
    }

    #[test]
    fn test_preemptive_inserts_own_call() {
        let mut config = test_config();
        config.preemptive = true;
        let mut digi = Digipeater::new(config);

        let p = packet_with_path(b">Test", &["WIDE2-2"]);
        let DigiDecision::Digipeat(out) = digi.decide(&p) else {
            panic!("expected digipeat");
        };
        assert_eq!(path_of(&out), vec!["DIGI*", "WIDE2-1"]);
    }

    #[test]
    fn test_fill_in_only_handles_wide1_1() {
        let mut config = test_config();
        config.fill_in = true;
        let mut digi = Digipeater::new(config);

        let p = packet_with_path(b">Test", &["WIDE1-1"]);
        let DigiDecision::Digipeat(out) = digi.decide(&p) else {
            panic!("expected digipeat");
        };
        assert_eq!(path_of(&out), vec!["DIGI*", "WIDE1*"]);

        let p = packet_with_path(b">Test2", &["WIDE2-2"]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::NoMatch));
    }

    #[test]
    fn test_excessive_flood_request() {
        let mut digi = Digipeater::new(test_config());

        // WIDE7-7 against max_hops = 2
        let p = packet_with_path(b">Test", &["WIDE7-7"]);
        assert_matches!(
            digi.decide(&p),
            DigiDecision::Drop(DropReason::MaxHopsExceeded)
        );
    }

    #[test]
    fn test_max_hops_post_condition() {
        let mut digi = Digipeater::new(test_config());

        let p = packet_with_path(b">Test", &["A1*", "B1*", "DIGI"]);
        assert_matches!(
            digi.decide(&p),
            DigiDecision::Drop(DropReason::MaxHopsExceeded)
        );
    }

    #[test]
    fn test_invalid_wide_forms() {
        let mut digi = Digipeater::new(test_config());

        // N greater than n is malformed
        let p = packet_with_path(b">Test", &["WIDE1-2"]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::NoMatch));

        // Consumed flood alias does not match
        let p = packet_with_path(b">Test2", &["WIDE2"]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::NoMatch));
    }

    #[test]
    fn test_acl() {
        let mut config = test_config();
        config.blacklist = vec!["N0CALL".to_string()];
        let mut digi = Digipeater::new(config);

        let p = packet_with_path(b">Test", &["WIDE1-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::Acl));

        let mut config = test_config();
        config.whitelist = vec!["K0OTHER".to_string()];
        let mut digi = Digipeater::new(config);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::Acl));
    }

    #[test]
    fn test_type_filters() {
        let mut config = test_config();
        config.filter_weather = true;
        let mut digi = Digipeater::new(config);

        let p = packet_with_path(b"_10090556c220s004g005t077", &["WIDE1-1"]);
        assert_matches!(
            digi.decide(&p),
            DigiDecision::Drop(DropReason::FilteredType)
        );

        let p = packet_with_path(b">ok", &["WIDE1-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Digipeat(_));
    }

    #[test]
    fn test_source_flooding() {
        let mut config = test_config();
        config.max_flood_rate = 2;
        let mut digi = Digipeater::new(config);

        for i in 0..3 {
            let p = packet_with_path(format!(">Test{}", i).as_bytes(), &["WIDE1-1"]);
            assert_matches!(digi.decide(&p), DigiDecision::Digipeat(_));
        }
        let p = packet_with_path(b">Test3", &["WIDE1-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::Flooding));
    }

    #[test]
    fn test_viscous_defer_and_fire() {
        let mut config = test_config();
        config.viscous_delay_ms = 1;
        let mut digi = Digipeater::new(config);

        let p = packet_with_path(b"!3553.50N/10602.50W>", &["WIDE1-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Defer(_));

        std::thread::sleep(Duration::from_millis(5));
        let due = digi.take_due();
        assert_eq!(due.len(), 1);
        assert_eq!(path_of(&due[0]), vec!["WIDE1*"]);
    }

    #[test]
    fn test_viscous_second_copy_cancels() {
        let mut config = test_config();
        config.viscous_delay_ms = 60_000;
        let mut digi = Digipeater::new(config);

        let p = packet_with_path(b"!3553.50N/10602.50W>", &["WIDE1-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Defer(_));

        // Second copy cancels the queued emission
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::Duplicate));
        assert!(digi.take_due().is_empty());

        // A third copy is a plain duplicate, not a new queue entry
        assert_matches!(digi.decide(&p), DigiDecision::Drop(DropReason::Duplicate));
    }

    #[test]
    fn test_viscous_only_for_positions() {
        let mut config = test_config();
        config.viscous_delay_ms = 60_000;
        let mut digi = Digipeater::new(config);

        let p = packet_with_path(b">status", &["WIDE1-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Digipeat(_));
    }

    #[test]
    fn test_sweep() {
        let mut digi = Digipeater::new(test_config());
        let p = packet_with_path(b">Test", &["WIDE1-1"]);
        assert_matches!(digi.decide(&p), DigiDecision::Digipeat(_));
        assert_eq!(digi.recent.len(), 1);

        digi.recent.get_mut(&packet_key(&p)).unwrap().seen =
            Instant::now() - Duration::from_secs(120);
        digi.sweep();
        assert!(digi.recent.is_empty());
    }
}
