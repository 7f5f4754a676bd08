use crate::aprs::AprsPacket;
use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Sliding-window duplicate filter keyed on `source ∥ md5(data)`. A packet
/// is a duplicate while an identical (source, data) pair was seen within
/// the window; entries are evicted by a periodic sweep.
pub struct DuplicateFilter {
    window: Duration,
    entries: HashMap<String, Instant>,
}

/// Content key shared with the digipeater's recent-packet map.
pub fn packet_key(packet: &AprsPacket) -> String {
    format!("{}|{:x}", packet.source, md5::compute(&packet.data))
}

impl DuplicateFilter {
    pub fn new(window: Duration) -> Self {
        DuplicateFilter {
            window,
            entries: HashMap::new(),
        }
    }

    pub fn is_duplicate(&self, packet: &AprsPacket) -> bool {
        match self.entries.get(&packet_key(packet)) {
            Some(seen) => seen.elapsed() <= self.window,
            None => false,
        }
    }

    pub fn record(&mut self, packet: &AprsPacket) {
        self.entries.insert(packet_key(packet), Instant::now());
    }

    pub fn sweep(&mut self) {
        let window = self.window;
        self.entries.retain(|_, seen| seen.elapsed() <= window);
        debug!("dedup sweep, {} entries remaining", self.entries.len());
    }

    #[cfg(test)]
    fn backdate(&mut self, packet: &AprsPacket, age: Duration) {
        self.entries
            .insert(packet_key(packet), Instant::now() - age);
    }
}
