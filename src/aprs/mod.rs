pub mod packet;
pub mod parser;
pub mod position;

pub use packet::{is_valid_callsign, AprsPacket, CallSign, PacketType, PathElement};
pub use parser::{parse_packet, ParseError};
pub use position::{extract_position, haversine_km, Position};
