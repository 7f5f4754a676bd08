use crate::aprs::{AprsPacket, PathElement};

/// The q-constructs APRS-IS servers exchange. Anything else starting with
/// `q` is malformed and gets stripped.
pub const Q_CONSTRUCTS: [&str; 9] = [
    "qAC", "qAX", "qAU", "qAo", "qAO", "qAS", "qAr", "qAR", "qAZ",
];

pub fn is_valid_q_construct(element: &str) -> bool {
    Q_CONSTRUCTS.contains(&element)
}

pub fn has_q_construct(packet: &AprsPacket) -> bool {
    packet
        .path
        .iter()
        .any(|hop| is_valid_q_construct(&hop.element))
}

/// Removes malformed `q...` path elements, keeping valid constructs.
pub fn sanitize(packet: &mut AprsPacket) {
    packet
        .path
        .retain(|hop| !hop.is_q_construct() || is_valid_q_construct(&hop.element));
}

/// Tags a client-submitted packet with its provenance: `qAC,<server>` for a
/// verified login, `qAX,<server>` otherwise. Packets that already carry a
/// valid construct pass through untouched.
pub fn append_client_construct(packet: &mut AprsPacket, verified: bool, server_call: &str) {
    sanitize(packet);
    if has_q_construct(packet) {
        return;
    }
    let construct = if verified { "qAC" } else { "qAX" };
    packet.path.push(PathElement::new(construct));
    packet.path.push(PathElement::new(server_call));
}

/// Marks a packet received directly off RF by this gateway: `qAR,<own>`.
pub fn append_gate_construct(packet: &mut AprsPacket, own_call: &str) {
    packet.path.push(PathElement::new("qAR"));
    packet.path.push(PathElement::new(own_call));
}

/// Prepares an IS-origin path for RF: drops `TCPIP*` and truncates at the
/// first q-construct (the construct and the server calls after it are
/// Internet-side provenance).
pub fn strip_for_rf(packet: &mut AprsPacket) {
    if let Some(pos) = packet.path.iter().position(|hop| hop.is_q_construct()) {
        packet.path.truncate(pos);
    }
    packet.path.retain(|hop| !hop.is_tcpip());
}
