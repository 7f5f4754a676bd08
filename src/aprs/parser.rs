use super::packet::{AprsPacket, CallSign, PathElement};
use thiserror::Error;

pub const MAX_PATH_ELEMENTS: usize = 8;
pub const MAX_LINE_BYTES: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no ':' separator in packet")]
    InvalidFormat,
    #[error("invalid packet header")]
    InvalidHeader,
    #[error("invalid callsign: {0}")]
    InvalidCallsign(String),
    #[error("invalid position data")]
    InvalidPosition,
}

/// Parses one raw APRS-IS / TNC2 line into a packet. The header is ASCII
/// text; the information field keeps its exact bytes. Trailing CR/LF is
/// trimmed, nothing else is altered.
pub fn parse_packet(input: &[u8]) -> Result<AprsPacket, ParseError> {
    let input = trim_line(input);
    if input.is_empty() || input.len() > MAX_LINE_BYTES {
        return Err(ParseError::InvalidFormat);
    }

    let header_end = input
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidFormat)?;
    let header =
        std::str::from_utf8(&input[..header_end]).map_err(|_| ParseError::InvalidHeader)?;
    let data = input[header_end + 1..].to_vec();

    let (source_str, rest) = header.split_once('>').ok_or(ParseError::InvalidHeader)?;

    let mut route = rest.split(',');
    let dest_str = route.next().filter(|s| !s.is_empty()).ok_or(ParseError::InvalidHeader)?;

    let source = CallSign::parse(source_str)
        .ok_or_else(|| ParseError::InvalidCallsign(source_str.to_string()))?;
    let destination = CallSign::parse(dest_str)
        .ok_or_else(|| ParseError::InvalidCallsign(dest_str.to_string()))?;

    let mut path = Vec::new();
    for token in route {
        if let Some(hop) = PathElement::parse(token) {
            path.push(hop);
        }
        if path.len() > MAX_PATH_ELEMENTS {
            return Err(ParseError::InvalidHeader);
        }
    }

    let mut packet = AprsPacket::new(source, destination, data);
    packet.path = path;

    Ok(packet)
}

fn trim_line(input: &[u8]) -> &[u8] {
    let mut end = input.len();
    while end > 0 && (input[end - 1] == b'\r' || input[end - 1] == b'\n') {
        end -= 1;
    }
    &input[..end]
}
