use crate::config::AclConfig;
use log::{info, warn};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const FLOOD_WINDOW: Duration = Duration::from_secs(60);

/// Connection-time allow/deny plus per-client flood limits. A client that
/// exceeds its rolling 60-second packet or byte budget is banned for the
/// configured duration; bans expire on their own.
pub struct AccessControl {
    config: AclConfig,
    flood: HashMap<u64, FloodWindow>,
    bans: HashMap<String, Instant>,
}

#[derive(Default)]
struct FloodWindow {
    events: VecDeque<(Instant, usize)>,
    bytes: usize,
}

impl FloodWindow {
    fn push(&mut self, size: usize) {
        self.events.push_back((Instant::now(), size));
        self.bytes += size;
        self.expire();
    }

    fn expire(&mut self) {
        while let Some(&(at, size)) = self.events.front() {
            if at.elapsed() > FLOOD_WINDOW {
                self.events.pop_front();
                self.bytes -= size;
            } else {
                break;
            }
        }
    }
}

impl AccessControl {
    pub fn new(config: AclConfig) -> Self {
        AccessControl {
            config,
            flood: HashMap::new(),
            bans: HashMap::new(),
        }
    }

    /// False iff the ip or callsign is blacklisted or currently banned, or
    /// a non-empty whitelist names neither of them.
    pub fn allow_connect(&mut self, ip: &str, callsign: Option<&str>) -> bool {
        let call = callsign.map(|c| c.to_uppercase());

        if self.is_banned(ip) || call.as_deref().is_some_and(|c| self.is_banned(c)) {
            return false;
        }

        let listed = |entry: &String| {
            entry.eq_ignore_ascii_case(ip)
                || call.as_deref().is_some_and(|c| entry.eq_ignore_ascii_case(c))
        };

        if self.config.blacklist.iter().any(|e| listed(e)) {
            return false;
        }
        if !self.config.whitelist.is_empty() && !self.config.whitelist.iter().any(|e| listed(e)) {
            return false;
        }
        true
    }

    /// Accounts one inbound packet for the client and returns whether it may
    /// be accepted. Exceeding the flood budget bans ip and callsign.
    pub fn allow_send(&mut self, client_id: u64, ip: &str, callsign: &str, size: usize) -> bool {
        if !self.config.flood_protection {
            return true;
        }

        let window = self.flood.entry(client_id).or_default();
        window.push(size);

        let over_packets = window.events.len() > self.config.max_packets_per_minute as usize;
        let over_bytes = window.bytes > self.config.max_bytes_per_minute as usize;
        if over_packets || over_bytes {
            warn!(
                "flood limit exceeded by {} ({}): {} pkts / {} bytes in window",
                callsign,
                ip,
                window.events.len(),
                window.bytes
            );
            let until = Instant::now() + Duration::from_secs(self.config.ban_duration_s);
            self.bans.insert(ip.to_string(), until);
            self.bans.insert(callsign.to_uppercase(), until);
            self.flood.remove(&client_id);
            return false;
        }
        true
    }

    pub fn forget_client(&mut self, client_id: u64) {
        self.flood.remove(&client_id);
    }

    fn is_banned(&self, key: &str) -> bool {
        match self.bans.get(key) {
            Some(until) => Instant::now() < *until,
            None => false,
        }
    }

    pub fn sweep(&mut self) {
        let now = Instant::now();
        let before = self.bans.len();
        self.bans.retain(|_, until| now < *until);
        if self.bans.len() != before {
            info!("{} ban(s) expired", before - self.bans.len());
        }
        for window in self.flood.values_mut() {
            window.expire();
        }
        self.flood.retain(|_, window| !window.events.is_empty());
    }
}
