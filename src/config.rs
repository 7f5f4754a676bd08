use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server identity used in q-constructs and login responses.
    pub server_call: String,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub rf: Vec<RfInterfaceConfig>,
    #[serde(default)]
    pub aprsis: Option<AprsIsConfig>,
    #[serde(default)]
    pub digipeater: DigipeaterConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub udp: Option<UdpConfig>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub acl: AclConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub beacon: Option<BeaconConfig>,
    #[serde(default)]
    pub status: Option<StatusConfig>,
    /// Window for the coordinator's content-keyed duplicate filter.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_replay_limit")]
    pub replay_limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RfInterfaceConfig {
    pub name: String,
    /// KISS TNC reachable over TCP (e.g. Direwolf, kissattach via socat).
    pub host: String,
    pub port: u16,
    #[serde(default = "default_true")]
    pub tx_enable: bool,
    #[serde(default = "default_true")]
    pub rx_enable: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AprsIsConfig {
    pub server: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    pub callsign: String,
    #[serde(default = "default_passcode")]
    pub passcode: String,
    pub filter: Option<String>,
    #[serde(default = "default_software")]
    pub software: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub tx_enable: bool,
    #[serde(default = "default_true")]
    pub rx_enable: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DigipeaterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub ssid: u8,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_flood_window_ms")]
    pub flood_window_ms: u64,
    #[serde(default = "default_max_flood_rate")]
    pub max_flood_rate: u32,
    #[serde(default)]
    pub viscous_delay_ms: u64,
    #[serde(default)]
    pub fill_in: bool,
    #[serde(default)]
    pub preemptive: bool,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub filter_weather: bool,
    #[serde(default)]
    pub filter_telemetry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsToRfPolicy {
    All,
    Heard,
    MessageOnly,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub rf_to_is: bool,
    #[serde(default)]
    pub is_to_rf: bool,
    #[serde(default = "default_is_to_rf_type")]
    pub is_to_rf_type: IsToRfPolicy,
    #[serde(default)]
    pub gate_local_only: bool,
    #[serde(default = "default_local_range_km")]
    pub local_range_km: f64,
    #[serde(default = "default_max_rf_rate")]
    pub max_rf_rate: u32,
    #[serde(default = "default_max_hops")]
    pub max_hops_to_rf: u8,
    #[serde(default = "default_true")]
    pub gate_messages: bool,
    #[serde(default = "default_true")]
    pub gate_positions: bool,
    #[serde(default = "default_true")]
    pub gate_weather: bool,
    #[serde(default = "default_true")]
    pub gate_telemetry: bool,
    #[serde(default = "default_true")]
    pub gate_objects: bool,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_heard_window_s")]
    pub heard_window_s: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UdpConfig {
    pub port: u16,
}

/// Persistent link to a peer server. Peers exchange locally admitted
/// traffic both ways; the duplicate window keeps loops from amplifying.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_passcode")]
    pub passcode: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AclConfig {
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub flood_protection: bool,
    #[serde(default = "default_max_packets_per_minute")]
    pub max_packets_per_minute: u32,
    #[serde(default = "default_max_bytes_per_minute")]
    pub max_bytes_per_minute: u32,
    #[serde(default = "default_ban_duration_s")]
    pub ban_duration_s: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_size")]
    pub size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BeaconConfig {
    #[serde(default)]
    pub enabled: bool,
    pub callsign: String,
    #[serde(default = "default_beacon_interval_s")]
    pub interval_s: u64,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_symbol_table")]
    pub symbol_table: char,
    #[serde(default = "default_symbol")]
    pub symbol: char,
    #[serde(default)]
    pub comment: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub send_to_is: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_status_interval_s")]
    pub interval_s: u64,
    #[serde(default)]
    pub comment: String,
}

fn default_true() -> bool {
    true
}

fn default_server_port() -> u16 {
    14580
}

fn default_max_clients() -> usize {
    50
}

fn default_replay_limit() -> usize {
    100
}

fn default_passcode() -> String {
    "-1".to_string()
}

fn default_software() -> String {
    "aprsgate".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_max_hops() -> u8 {
    2
}

fn default_dedup_window_ms() -> u64 {
    30_000
}

fn default_flood_window_ms() -> u64 {
    60_000
}

fn default_max_flood_rate() -> u32 {
    10
}

fn default_is_to_rf_type() -> IsToRfPolicy {
    IsToRfPolicy::Heard
}

fn default_local_range_km() -> f64 {
    50.0
}

fn default_max_rf_rate() -> u32 {
    6
}

fn default_heard_window_s() -> u64 {
    600
}

fn default_max_packets_per_minute() -> u32 {
    120
}

fn default_max_bytes_per_minute() -> u32 {
    65_536
}

fn default_ban_duration_s() -> u64 {
    300
}

fn default_history_size() -> usize {
    10_000
}

fn default_beacon_interval_s() -> u64 {
    1200
}

fn default_status_interval_s() -> u64 {
    1200
}

fn default_symbol_table() -> char {
    '/'
}

fn default_symbol() -> char {
    '&'
}

impl Default for DigipeaterConfig {
    fn default() -> Self {
        DigipeaterConfig {
            enabled: false,
            callsign: String::new(),
            ssid: 0,
            aliases: Vec::new(),
            max_hops: default_max_hops(),
            dedup_window_ms: default_dedup_window_ms(),
            flood_window_ms: default_flood_window_ms(),
            max_flood_rate: default_max_flood_rate(),
            viscous_delay_ms: 0,
            fill_in: false,
            preemptive: false,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            filter_weather: false,
            filter_telemetry: false,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            rf_to_is: true,
            is_to_rf: false,
            is_to_rf_type: default_is_to_rf_type(),
            gate_local_only: false,
            local_range_km: default_local_range_km(),
            max_rf_rate: default_max_rf_rate(),
            max_hops_to_rf: default_max_hops(),
            gate_messages: true,
            gate_positions: true,
            gate_weather: true,
            gate_telemetry: true,
            gate_objects: true,
            dedup_window_ms: default_dedup_window_ms(),
            heard_window_s: default_heard_window_s(),
            latitude: None,
            longitude: None,
        }
    }
}

impl Default for AclConfig {
    fn default() -> Self {
        AclConfig {
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            flood_protection: false,
            max_packets_per_minute: default_max_packets_per_minute(),
            max_bytes_per_minute: default_max_bytes_per_minute(),
            ban_duration_s: default_ban_duration_s(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            size: default_history_size(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::anyhow!(
                    "Configuration file not found: {}\n\
                         Hint: Copy aprsgate.conf.example to {} and edit it with your settings.\n\
                         Or use --config to specify a different path.",
                    path.display(),
                    path.display()
                )
            } else {
                anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
            }
        })?;
        Self::parse(&contents).map_err(|e| {
            anyhow::anyhow!(
                "Failed to parse configuration file {}: {}\n\
                     Hint: Check the TOML syntax. Common issues:\n\
                     - Missing quotes around strings\n\
                     - Incorrect array syntax (use [[section]] for arrays)\n\
                     - Invalid data types for fields",
                path.display(),
                e
            )
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}
