use super::packet::{AprsPacket, PacketType};

const LAT_SCALE: f64 = 380_926.0;
const LON_SCALE: f64 = 190_463.0;
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub symbol_table: char,
    pub symbol: char,
}

/// Extracts a position from a position-class packet. Uncompressed
/// `DDMM.mmN/DDDMM.mmW` and compressed base-91 bodies are both read;
/// Mic-E destination-field positions are not decoded.
pub fn extract_position(packet: &AprsPacket) -> Option<Position> {
    let body = match packet.packet_type {
        PacketType::PositionNoTs | PacketType::PositionCompressed => packet.data.get(1..)?,
        PacketType::PositionWithTs | PacketType::PositionWithTsMsg => {
            // Skip the 7-byte timestamp after the type indicator
            packet.data.get(8..)?
        }
        _ => return None,
    };

    match body.first() {
        Some(b) if b.is_ascii_digit() => parse_uncompressed(body),
        Some(_) => parse_compressed(body),
        None => None,
    }
}

/// `DDMM.mmN/DDDMM.mmW` with a symbol table byte between latitude and
/// longitude and the symbol code after the longitude.
fn parse_uncompressed(body: &[u8]) -> Option<Position> {
    if body.len() < 19 {
        return None;
    }
    let lat_str = std::str::from_utf8(&body[0..7]).ok()?;
    let ns = body[7] as char;
    let symbol_table = body[8] as char;
    let lon_str = std::str::from_utf8(&body[9..17]).ok()?;
    let ew = body[17] as char;
    let symbol = body[18] as char;

    let lat_deg: f64 = lat_str[0..2].parse().ok()?;
    let lat_min: f64 = lat_str[2..7].parse().ok()?;
    let lon_deg: f64 = lon_str[0..3].parse().ok()?;
    let lon_min: f64 = lon_str[3..8].parse().ok()?;

    if lat_min >= 60.0 || lon_min >= 60.0 || lat_deg > 90.0 || lon_deg > 180.0 {
        return None;
    }

    let mut latitude = lat_deg + lat_min / 60.0;
    let mut longitude = lon_deg + lon_min / 60.0;
    match ns {
        'N' => {}
        'S' => latitude = -latitude,
        _ => return None,
    }
    match ew {
        'E' => {}
        'W' => longitude = -longitude,
        _ => return None,
    }

    Some(Position {
        latitude,
        longitude,
        symbol_table,
        symbol,
    })
}

/// Base-91 compressed form: symbol table byte, 4 latitude bytes, 4
/// longitude bytes, symbol code.
fn parse_compressed(body: &[u8]) -> Option<Position> {
    if body.len() < 10 {
        return None;
    }
    let symbol_table = body[0] as char;
    let lat_raw = base91(&body[1..5])?;
    let lon_raw = base91(&body[5..9])?;
    let symbol = body[9] as char;

    let latitude = 90.0 - lat_raw as f64 / LAT_SCALE;
    let longitude = -180.0 + lon_raw as f64 / LON_SCALE;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }

    Some(Position {
        latitude,
        longitude,
        symbol_table,
        symbol,
    })
}

fn base91(bytes: &[u8]) -> Option<u32> {
    let mut value: u32 = 0;
    for &b in bytes {
        if !(33..=124).contains(&b) {
            return None;
        }
        value = value * 91 + (b - 33) as u32;
    }
    Some(value)
}

/// Great-circle distance in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}
