use crate::aprs::{extract_position, haversine_km, AprsPacket, PacketType};
use log::debug;
use std::str::FromStr;

/// One element of an APRS-IS style filter expression. A client's filter is
/// an OR-list of these.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterSpec {
    Range { lat: f64, lon: f64, radius_km: f64 },
    Prefix(Vec<String>),
    Budlist(Vec<String>),
    Type(Vec<TypeClass>),
    Symbol(Vec<char>),
    Object(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Position,
    Object,
    Item,
    Message,
    Query,
    Status,
    Telemetry,
    Weather,
    Nws,
    UserDefined,
}

impl TypeClass {
    fn from_char(c: char) -> Option<TypeClass> {
        match c {
            'p' => Some(TypeClass::Position),
            'o' => Some(TypeClass::Object),
            'i' => Some(TypeClass::Item),
            'm' => Some(TypeClass::Message),
            'q' => Some(TypeClass::Query),
            's' => Some(TypeClass::Status),
            't' => Some(TypeClass::Telemetry),
            'w' => Some(TypeClass::Weather),
            'n' => Some(TypeClass::Nws),
            'u' => Some(TypeClass::UserDefined),
            _ => None,
        }
    }

    fn matches(&self, packet: &AprsPacket) -> bool {
        match self {
            TypeClass::Position => packet.packet_type.is_position(),
            TypeClass::Object => packet.packet_type == PacketType::Object,
            TypeClass::Item => packet.packet_type == PacketType::Item,
            TypeClass::Message => packet.packet_type.is_message(),
            TypeClass::Query => packet.packet_type == PacketType::Query,
            TypeClass::Status => packet.packet_type == PacketType::Status,
            TypeClass::Telemetry => packet.packet_type == PacketType::Telemetry,
            TypeClass::Weather => packet.packet_type == PacketType::Weather,
            TypeClass::Nws => {
                packet.destination.call.starts_with("NWS")
                    || packet.packet_type == PacketType::Bulletin
            }
            TypeClass::UserDefined => packet.packet_type == PacketType::UserDefined,
        }
    }
}

impl FromStr for FilterSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let kind = parts.next().ok_or("empty filter token")?;
        let args: Vec<&str> = parts.filter(|a| !a.is_empty()).collect();

        match kind {
            "r" => {
                if args.len() != 3 {
                    return Err(format!("range filter needs 3 arguments: {}", s));
                }
                let lat = args[0].parse().map_err(|_| "invalid latitude")?;
                let lon = args[1].parse().map_err(|_| "invalid longitude")?;
                let radius_km = args[2].parse().map_err(|_| "invalid radius")?;
                Ok(FilterSpec::Range {
                    lat,
                    lon,
                    radius_km,
                })
            }
            "p" if !args.is_empty() => {
                Ok(FilterSpec::Prefix(args.iter().map(|a| a.to_string()).collect()))
            }
            "b" if !args.is_empty() => Ok(FilterSpec::Budlist(
                args.iter().map(|a| a.to_uppercase()).collect(),
            )),
            "t" if args.len() == 1 => {
                let classes: Vec<TypeClass> =
                    args[0].chars().filter_map(TypeClass::from_char).collect();
                if classes.is_empty() {
                    return Err(format!("no recognized type flags: {}", s));
                }
                Ok(FilterSpec::Type(classes))
            }
            "s" if !args.is_empty() => Ok(FilterSpec::Symbol(
                args.iter().flat_map(|a| a.chars()).collect(),
            )),
            "o" if !args.is_empty() => {
                Ok(FilterSpec::Object(args.iter().map(|a| a.to_string()).collect()))
            }
            _ => Err(format!("unknown filter type: {}", s)),
        }
    }
}

impl FilterSpec {
    pub fn matches(&self, packet: &AprsPacket) -> bool {
        match self {
            FilterSpec::Range {
                lat,
                lon,
                radius_km,
            } => match extract_position(packet) {
                Some(pos) => {
                    haversine_km(*lat, *lon, pos.latitude, pos.longitude) <= *radius_km
                }
                None => false,
            },
            FilterSpec::Prefix(prefixes) => {
                let source = packet.source.to_string();
                prefixes.iter().any(|p| source.starts_with(p.as_str()))
            }
            FilterSpec::Budlist(calls) => calls.iter().any(|call| {
                packet.source.to_string() == *call
                    || packet.destination.to_string() == *call
                    || packet.path.iter().any(|hop| hop.element == *call)
            }),
            FilterSpec::Type(classes) => classes.iter().any(|class| class.matches(packet)),
            FilterSpec::Symbol(symbols) => match extract_position(packet) {
                Some(pos) => symbols.contains(&pos.symbol),
                None => false,
            },
            FilterSpec::Object(names) => match object_name(packet) {
                Some(name) => names.iter().any(|n| *n == name),
                None => false,
            },
        }
    }
}

/// Parses a space-separated filter expression. Unknown or malformed tokens
/// are dropped silently (logged at debug).
pub fn parse_filter(expression: &str) -> Vec<FilterSpec> {
    let mut specs = Vec::new();
    for token in expression.split_whitespace() {
        match token.parse::<FilterSpec>() {
            Ok(spec) => specs.push(spec),
            Err(e) => debug!("dropping filter token {:?}: {}", token, e),
        }
    }
    specs
}

/// OR semantics across the list; an empty filter matches everything.
pub fn matches_any(filters: &[FilterSpec], packet: &AprsPacket) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(packet))
}

/// Name of an object (`;NAME     *...`) or item (`)NAME!...`) packet.
fn object_name(packet: &AprsPacket) -> Option<String> {
    match packet.packet_type {
        PacketType::Object => {
            let name = packet.data.get(1..10)?;
            let name = String::from_utf8_lossy(name);
            let name = name.trim_end();
            (!name.is_empty()).then(|| name.to_string())
        }
        PacketType::Item => {
            let body = packet.data.get(1..)?;
            let end = body
                .iter()
                .position(|&b| b == b'!' || b == b'_')
                .filter(|&n| n <= 9)?;
            let name = String::from_utf8_lossy(&body[..end]);
            let name = name.trim_end();
            (!name.is_empty()).then(|| name.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aprs::{parse_packet, CallSign, PathElement};

    fn packet(data: &[u8]) -> AprsPacket {
        AprsPacket::new(
            CallSign::new("N0CALL", 0),
            CallSign::new("APRS", 0),
            data.to_vec(),
        )
    }

    #[test]
    fn test_parse_range_filter() {
        let specs = parse_filter("r/35/-106/100");
        assert_eq!(
            specs,
            vec![FilterSpec::Range {
                lat: 35.0,
                lon: -106.0,
                radius_km: 100.0
            }]
        );

        // Bad floats drop the token
        assert!(parse_filter("r/x/y/z").is_empty());
        assert!(parse_filter("r/35/-106").is_empty());
    }

    #[test]
    fn test_parse_mixed_expression() {
        let specs = parse_filter("r/35/-106/100 p/N0/KC0 t/pm z/bogus");
        assert_eq!(specs.len(), 3);
        assert_eq!(
            specs[1],
            FilterSpec::Prefix(vec!["N0".to_string(), "KC0".to_string()])
        );
        assert_eq!(
            specs[2],
            FilterSpec::Type(vec![TypeClass::Position, TypeClass::Message])
        );
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(matches_any(&[], &packet(b">anything")));
        assert!(parse_filter("   ").is_empty());
    }

    #[test]
    fn test_range_match() {
        let specs = parse_filter("r/35.9/-106.0/50");
        let p = packet(b"!3553.50N/10602.50W>Test");
        assert!(matches_any(&specs, &p));

        // No position: range never matches
        assert!(!matches_any(&specs, &packet(b">status")));

        let far = parse_filter("r/10/10/50");
        assert!(!matches_any(&far, &p));
    }

    #[test]
    fn test_prefix_match() {
        let specs = parse_filter("p/N0");
        assert!(matches_any(&specs, &packet(b">x")));

        let specs = parse_filter("p/KC0");
        assert!(!matches_any(&specs, &packet(b">x")));

        // Case-sensitive per the filter spec
        let specs = parse_filter("p/n0");
        assert!(!matches_any(&specs, &packet(b">x")));
    }

    #[test]
    fn test_budlist_match() {
        let mut p = packet(b">x");
        p.path.push(PathElement::new("WIDE1-1"));

        assert!(matches_any(&parse_filter("b/N0CALL"), &p));
        assert!(matches_any(&parse_filter("b/APRS"), &p));
        assert!(matches_any(&parse_filter("b/WIDE1-1"), &p));
        assert!(!matches_any(&parse_filter("b/N0CAL"), &p));
        assert!(matches_any(&parse_filter("b/XX/N0CALL"), &p));
    }

    #[test]
    fn test_type_match() {
        let message = packet(b":KC0ABC   :hi");
        let position = packet(b"!3553.50N/10602.50W>");
        let status = packet(b">status");

        let m_only = parse_filter("t/m");
        assert!(matches_any(&m_only, &message));
        assert!(!matches_any(&m_only, &position));
        assert!(!matches_any(&m_only, &status));

        let pm = parse_filter("t/pm");
        assert!(matches_any(&pm, &message));
        assert!(matches_any(&pm, &position));
        assert!(!matches_any(&pm, &status));
    }

    #[test]
    fn test_symbol_match() {
        let p = packet(b"!3553.50N/10602.50W>Test");
        assert!(matches_any(&parse_filter("s/>"), &p));
        assert!(!matches_any(&parse_filter("s/#"), &p));
    }

    #[test]
    fn test_object_match() {
        let obj = parse_packet(b"N0CALL>APRS:;LEADER   *092345z4903.50N/07201.75W>").unwrap();
        assert!(matches_any(&parse_filter("o/LEADER"), &obj));
        assert!(!matches_any(&parse_filter("o/OTHER"), &obj));

        let item = parse_packet(b"N0CALL>APRS:)AID!4903.50N/07201.75W!").unwrap();
        assert!(matches_any(&parse_filter("o/AID"), &item));
    }

    #[test]
    fn test_spec_scenario_filter() {
        // Filter `r/35/-106/100 p/N0 t/pm` matches a message from N0CALL
        let specs = parse_filter("r/35/-106/100 p/N0 t/pm");
        let p = parse_packet(b"N0CALL>APRS::KC0ABC   :hi").unwrap();
        assert!(matches_any(&specs, &p));
    }
}
