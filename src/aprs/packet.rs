use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

lazy_static! {
    static ref CALLSIGN_RE: Regex = Regex::new(r"^[A-Z0-9]{1,6}(-(1[0-5]|[0-9]))?$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSign {
    pub call: String,
    pub ssid: u8,
}

/// One hop of the digipeater path. The token keeps its exact spelling
/// (q-constructs are case-sensitive); `used` is the trailing `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathElement {
    pub element: String,
    pub used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    PositionNoTs,
    PositionWithTs,
    PositionWithTsMsg,
    PositionCompressed,
    Message,
    Status,
    Object,
    Item,
    MicE,
    Weather,
    Telemetry,
    Query,
    Bulletin,
    UserDefined,
    ThirdParty,
    RawGps,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AprsPacket {
    pub source: CallSign,
    pub destination: CallSign,
    pub path: Vec<PathElement>,
    pub data: Vec<u8>,
    pub packet_type: PacketType,
    pub timestamp: DateTime<Utc>,
}

pub fn is_valid_callsign(input: &str) -> bool {
    let upper = input.to_uppercase();
    CALLSIGN_RE.is_match(&upper) && upper.chars().any(|c| c.is_ascii_alphabetic())
}

impl CallSign {
    pub fn new(call: &str, ssid: u8) -> Self {
        CallSign {
            call: call.to_uppercase(),
            ssid,
        }
    }

    /// Parses and canonicalizes `CALL` or `CALL-SSID`. Case-insensitive on
    /// input, upper case out, SSID 0-15, at least one letter in the base.
    pub fn parse(input: &str) -> Option<Self> {
        let upper = input.to_uppercase();
        if !CALLSIGN_RE.is_match(&upper) {
            return None;
        }
        let (call, ssid) = match upper.split_once('-') {
            Some((call, ssid)) => (call.to_string(), ssid.parse::<u8>().ok()?),
            None => (upper, 0),
        };
        if !call.chars().any(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        Some(CallSign { call, ssid })
    }
}

impl fmt::Display for CallSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.call)
        } else {
            write!(f, "{}-{}", self.call, self.ssid)
        }
    }
}

impl PathElement {
    pub fn new(element: &str) -> Self {
        PathElement {
            element: element.to_string(),
            used: false,
        }
    }

    pub fn used(element: &str) -> Self {
        PathElement {
            element: element.to_string(),
            used: true,
        }
    }

    /// Parses one comma-separated path token. Everything except q-constructs
    /// is canonicalized to upper case; a trailing `*` becomes `used`.
    pub fn parse(input: &str) -> Option<Self> {
        let (token, used) = match input.strip_suffix('*') {
            Some(stripped) => (stripped, true),
            None => (input, false),
        };
        if token.is_empty() || token.contains('*') {
            return None;
        }
        let element = if token.starts_with('q') {
            token.to_string()
        } else {
            token.to_uppercase()
        };
        Some(PathElement { element, used })
    }

    pub fn is_q_construct(&self) -> bool {
        self.element.starts_with('q')
    }

    pub fn is_tcpip(&self) -> bool {
        self.element == "TCPIP"
    }

    pub fn is_nogate(&self) -> bool {
        self.element == "NOGATE"
    }

    pub fn is_rfonly(&self) -> bool {
        self.element == "RFONLY"
    }

    /// `WIDEn-N` → `(n, N)`; a consumed `WIDEn` (no suffix) yields N = 0.
    pub fn wide_hops(&self) -> Option<(u8, u8)> {
        flood_hops(&self.element, "WIDE")
    }

    /// `TRACEn-N` → `(n, N)`, as `wide_hops`.
    pub fn trace_hops(&self) -> Option<(u8, u8)> {
        flood_hops(&self.element, "TRACE")
    }
}

fn flood_hops(element: &str, family: &str) -> Option<(u8, u8)> {
    let rest = element.strip_prefix(family)?;
    let (order, remaining) = match rest.split_once('-') {
        Some((order, remaining)) => (order, remaining.parse::<u8>().ok()?),
        None => (rest, 0),
    };
    if order.len() != 1 {
        return None;
    }
    let n = order.chars().next()?.to_digit(10)? as u8;
    if n == 0 {
        return None;
    }
    Some((n, remaining))
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.element, if self.used { "*" } else { "" })
    }
}

impl PacketType {
    /// Classifies from the first byte of the information field.
    pub fn classify(data: &[u8]) -> PacketType {
        let Some(&first) = data.first() else {
            return PacketType::Unknown;
        };

        match first {
            b'!' | b'=' => {
                if data.len() > 1 && data[1].is_ascii_digit() {
                    PacketType::PositionNoTs
                } else {
                    PacketType::PositionCompressed
                }
            }
            b'/' => PacketType::PositionWithTs,
            b'@' => PacketType::PositionWithTsMsg,
            b':' => {
                if data.len() > 4 && data[1..].starts_with(b"BLN") {
                    PacketType::Bulletin
                } else {
                    PacketType::Message
                }
            }
            b'>' => PacketType::Status,
            b';' => PacketType::Object,
            b')' => PacketType::Item,
            b'`' | b'\'' => PacketType::MicE,
            b'_' => PacketType::Weather,
            b'T' => PacketType::Telemetry,
            b'?' => PacketType::Query,
            b'{' => PacketType::UserDefined,
            b'}' => PacketType::ThirdParty,
            b'$' => PacketType::RawGps,
            _ => PacketType::Unknown,
        }
    }

    pub fn is_position(&self) -> bool {
        matches!(
            self,
            PacketType::PositionNoTs
                | PacketType::PositionWithTs
                | PacketType::PositionWithTsMsg
                | PacketType::PositionCompressed
                | PacketType::MicE
        )
    }

    pub fn is_message(&self) -> bool {
        matches!(self, PacketType::Message | PacketType::Bulletin)
    }
}

impl AprsPacket {
    pub fn new(source: CallSign, destination: CallSign, data: Vec<u8>) -> Self {
        let packet_type = PacketType::classify(&data);

        AprsPacket {
            source,
            destination,
            path: Vec::new(),
            data,
            packet_type,
            timestamp: Utc::now(),
        }
    }

    /// Canonical wire form: `SOURCE>DEST[,P1,P2,...]:DATA`. Data bytes pass
    /// through verbatim, including 8-bit values.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 32);
        out.extend_from_slice(self.source.to_string().as_bytes());
        out.push(b'>');
        out.extend_from_slice(self.destination.to_string().as_bytes());
        for hop in &self.path {
            out.push(b',');
            out.extend_from_slice(hop.to_string().as_bytes());
        }
        out.push(b':');
        out.extend_from_slice(&self.data);
        out
    }

    pub fn used_hops(&self) -> usize {
        self.path.iter().filter(|hop| hop.used).count()
    }

    pub fn has_nogate(&self) -> bool {
        self.path.iter().any(|hop| hop.is_nogate())
    }

    pub fn has_rfonly(&self) -> bool {
        self.path.iter().any(|hop| hop.is_rfonly())
    }

    pub fn is_third_party(&self) -> bool {
        self.data.first() == Some(&b'}')
    }

    /// Addressee of a message packet (`:ADDRESSEE:text`), trimmed.
    pub fn message_addressee(&self) -> Option<String> {
        if !self.packet_type.is_message() || self.data.len() < 11 {
            return None;
        }
        if self.data[0] != b':' || self.data[10] != b':' {
            return None;
        }
        let addressee = String::from_utf8_lossy(&self.data[1..10]);
        let addressee = addressee.trim();
        if addressee.is_empty() {
            None
        } else {
            Some(addressee.to_string())
        }
    }
}

impl fmt::Display for AprsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.encode()))
    }
}
