//! Router syslog message parser
//!
//! Understands the handful of formats the gateway firmware emits: iptables
//! firewall lines, dnsmasq DHCP and DNS activity, access point association
//! events. Everything else is kept as a `System` event with the raw text.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::parsed_event::{DhcpEvent, DnsEvent, FirewallEvent, ParsedEvent, ParsedMessage, WifiEvent};

static RE_PRI: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<(\d{1,3})>").expect("regex"));

static RE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z][a-z]{2})\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})\s+(\S+)\s+(.*)$").expect("regex")
});

static RE_PROGRAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z][\w.\-/]*)(?:\[(\d+)\])?:\s*(.*)$").expect("regex"));

static RE_KV: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-Z]+)=(\S*)").expect("regex"));

static RE_RULE_BRACKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([A-Za-z][^\]\s]*)\]").expect("regex"));

static RE_DESCR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"DESCR="([^"]*)""#).expect("regex"));

static RE_DHCP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(DHCP[A-Z]+)(?:\(([^)]+)\))?\s*(.*)$").expect("regex"));

static RE_MAC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").expect("regex"));

static RE_IPV4_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}(?:\.\d{1,3}){3}$").expect("regex"));

static RE_WIFI_STA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([\w.\-]+):\s+)?STA\s+((?:[0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2})\s+(.*)$").expect("regex")
});

static RE_JSON_MAC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""mac"\s*:\s*"((?:[0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2})""#).expect("regex"));
static RE_JSON_EVENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""event_type"\s*:\s*"(\w+)""#).expect("regex"));
static RE_JSON_VAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""vap"\s*:\s*"([\w.\-]+)""#).expect("regex"));

static RE_DNS_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^query\[(\w+)\]\s+(\S+)\s+from\s+(\S+)$").expect("regex"));
static RE_DNS_FORWARDED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^forwarded\s+(\S+)\s+to\s+(\S+)$").expect("regex"));
static RE_DNS_ANSWER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(reply|cached)\s+(\S+)\s+is\s+(.+)$").expect("regex"));

const WIFI_PROGRAMS: &[&str] = &["hostapd", "stahtd", "stamgr"];

/// Why a datagram could not become an event
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("empty message")]
    Empty,

    #[error("invalid address in {field}: '{value}'")]
    InvalidAddress { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default)]
pub struct MessageParser {
    utc_offset_minutes: i32,
}

impl MessageParser {
    /// `utc_offset_minutes` is the offset of the router's clock from UTC
    pub fn new(utc_offset_minutes: i32) -> Self {
        Self { utc_offset_minutes }
    }

    pub fn parse(&self, raw: &str) -> Result<ParsedMessage, ParseFailure> {
        self.parse_at(raw, Utc::now())
    }

    /// Parse against a fixed receive time
    pub fn parse_at(&self, raw: &str, now: DateTime<Utc>) -> Result<ParsedMessage, ParseFailure> {
        let line = raw.trim_end_matches(['\n', '\r', '\0']).trim();
        if line.is_empty() {
            return Err(ParseFailure::Empty);
        }
        let line = RE_PRI.find(line).map_or(line, |m| &line[m.end()..]);

        let (timestamp, hostname, body) = match RE_HEADER.captures(line) {
            Some(caps) => {
                let ts = self.header_timestamp(&caps[1], &caps[2], &caps[3], now).unwrap_or(now);
                (ts, Some(caps[4].to_string()), caps.get(5).map_or("", |m| m.as_str()))
            }
            None => (now, None, line),
        };

        let (program, message) = match RE_PROGRAM.captures(body) {
            Some(caps) if !body.starts_with('[') => (
                Some(caps[1].to_string()),
                caps.get(3).map_or("", |m| m.as_str()),
            ),
            _ => (None, body),
        };

        let event = dispatch(program.as_deref(), message)?;

        Ok(ParsedMessage {
            timestamp,
            hostname,
            program,
            raw: raw.trim_end_matches(['\n', '\r', '\0']).to_string(),
            event,
        })
    }

    /// Resolve a year-less BSD timestamp.
    ///
    /// The current year is assumed unless the month is more than six months
    /// ahead of the current one, which means the line predates a new year.
    fn header_timestamp(&self, month: &str, day: &str, time: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let month = month_number(month)?;
        let day: u32 = day.parse().ok()?;
        let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;

        let offset = Duration::minutes(self.utc_offset_minutes as i64);
        let local_now = now + offset;
        let mut year = local_now.year();
        if month as i32 - local_now.month() as i32 > 6 {
            year -= 1;
        }

        let local = NaiveDate::from_ymd_opt(year, month, day)?.and_time(time);
        Some(Utc.from_utc_datetime(&(local - offset)))
    }
}

fn month_number(month: &str) -> Option<u32> {
    let n = match month {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    Some(n)
}

fn dispatch(program: Option<&str>, message: &str) -> Result<ParsedEvent, ParseFailure> {
    if message.contains("SRC=") && message.contains("DST=") {
        return parse_firewall(message).map(ParsedEvent::Firewall);
    }

    let program = program.unwrap_or("");

    if program == "dnsmasq-dhcp" || RE_DHCP.is_match(message) {
        if let Some(event) = parse_dhcp(message)? {
            return Ok(ParsedEvent::Dhcp(event));
        }
    }

    if WIFI_PROGRAMS.iter().any(|p| program.starts_with(p)) {
        if let Some(event) = parse_wifi(message) {
            return Ok(ParsedEvent::Wifi(event));
        }
    }

    if program.is_empty() || program == "dnsmasq" {
        if let Some(event) = parse_dns(message)? {
            return Ok(ParsedEvent::Dns(event));
        }
    }

    Ok(ParsedEvent::System)
}

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, ParseFailure> {
    value.parse().map_err(|_| ParseFailure::InvalidAddress {
        field,
        value: value.to_string(),
    })
}

fn non_empty(value: Option<&&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(|v| v.to_string())
}

fn parse_firewall(message: &str) -> Result<FirewallEvent, ParseFailure> {
    let rule_desc = RE_DESCR.captures(message).map(|c| c[1].to_string());
    let stripped = RE_DESCR.replace(message, "");

    let fields: HashMap<&str, &str> = RE_KV
        .captures_iter(&stripped)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect();

    let src_ip = parse_ip("SRC", fields.get("SRC").copied().unwrap_or(""))?;
    let dst_ip = parse_ip("DST", fields.get("DST").copied().unwrap_or(""))?;

    let rule_name = non_empty(fields.get("RULE")).or_else(|| {
        let before_kv = stripped.split("IN=").next().unwrap_or("");
        RE_RULE_BRACKET
            .captures(before_kv)
            .map(|c| c[1].to_string())
    });

    Ok(FirewallEvent {
        rule_name,
        rule_desc: rule_desc.filter(|d| !d.is_empty()),
        interface_in: non_empty(fields.get("IN")),
        interface_out: non_empty(fields.get("OUT")),
        mac: non_empty(fields.get("MAC")),
        src_ip,
        dst_ip,
        protocol: non_empty(fields.get("PROTO")),
        src_port: fields.get("SPT").and_then(|p| p.parse().ok()),
        dst_port: fields.get("DPT").and_then(|p| p.parse().ok()),
    })
}

/// Token that was meant to be an address, valid or not
fn looks_like_ip(token: &str) -> bool {
    RE_IPV4_LIKE.is_match(token)
        || (token.contains(':')
            && !RE_MAC.is_match(token)
            && token.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.'))
}

fn parse_dhcp(message: &str) -> Result<Option<DhcpEvent>, ParseFailure> {
    let caps = match RE_DHCP.captures(message) {
        Some(caps) => caps,
        None => return Ok(None),
    };

    let mut event = DhcpEvent {
        event: caps[1].to_string(),
        interface: caps.get(2).map(|m| m.as_str().to_string()),
        ip: None,
        mac: None,
        hostname: None,
    };

    for token in caps.get(3).map_or("", |m| m.as_str()).split_whitespace() {
        if RE_MAC.is_match(token) {
            event.mac.get_or_insert_with(|| token.to_lowercase());
        } else if looks_like_ip(token) {
            let ip = parse_ip("DHCP", token)?;
            event.ip.get_or_insert(ip);
        } else if event.hostname.is_none() && event.mac.is_some() {
            event.hostname = Some(token.to_string());
        }
    }

    Ok(Some(event))
}

fn wifi_event_name(rest: &str) -> Option<&'static str> {
    let rest = rest.to_ascii_lowercase();
    if rest.contains("disassociated") {
        Some("disassociated")
    } else if rest.contains("deauthenticated") {
        Some("deauthenticated")
    } else if rest.contains("handshake completed") {
        Some("handshake_completed")
    } else if rest.contains("associated") {
        Some("associated")
    } else if rest.contains("authenticated") {
        Some("authenticated")
    } else {
        None
    }
}

fn parse_wifi(message: &str) -> Option<WifiEvent> {
    if let Some(caps) = RE_WIFI_STA.captures(message) {
        let event = wifi_event_name(&caps[3])?;
        return Some(WifiEvent {
            event: event.to_string(),
            interface: caps.get(1).map(|m| m.as_str().to_string()),
            mac: Some(caps[2].to_lowercase()),
        });
    }

    // stamgr/stahtd tracker dumps carry a JSON body
    let mac = RE_JSON_MAC.captures(message)?;
    let event = RE_JSON_EVENT.captures(message)?;
    Some(WifiEvent {
        event: event[1].to_string(),
        interface: RE_JSON_VAP.captures(message).map(|c| c[1].to_string()),
        mac: Some(mac[1].to_lowercase()),
    })
}

fn parse_dns(message: &str) -> Result<Option<DnsEvent>, ParseFailure> {
    if let Some(caps) = RE_DNS_QUERY.captures(message) {
        return Ok(Some(DnsEvent {
            action: "query".to_string(),
            query: caps[2].to_string(),
            query_type: Some(caps[1].to_string()),
            answer: None,
            peer_ip: Some(parse_ip("DNS client", &caps[3])?),
        }));
    }

    if let Some(caps) = RE_DNS_FORWARDED.captures(message) {
        return Ok(Some(DnsEvent {
            action: "forwarded".to_string(),
            query: caps[1].to_string(),
            query_type: None,
            answer: None,
            peer_ip: Some(parse_ip("DNS upstream", &caps[2])?),
        }));
    }

    if let Some(caps) = RE_DNS_ANSWER.captures(message) {
        return Ok(Some(DnsEvent {
            action: caps[1].to_string(),
            query: caps[2].to_string(),
            query_type: None,
            answer: Some(caps[3].trim().to_string()),
            peer_ip: None,
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    const FIREWALL: &str = "<4>Mar  3 10:23:45 UDM-Pro kernel: [WAN_IN-2000-B]IN=eth8 OUT=br0 \
        MAC=aa:bb:cc:dd:ee:ff:11:22:33:44:55:66:08:00 SRC=203.0.113.5 DST=192.168.1.50 LEN=60 \
        TOS=0x00 PREC=0x00 TTL=52 ID=1234 DF PROTO=TCP SPT=51234 DPT=22 WINDOW=64240 RES=0x00 SYN URGP=0";

    #[test]
    fn test_firewall_line() {
        let parser = MessageParser::default();
        let msg = parser.parse_at(FIREWALL, at(2026, 3, 3, 12)).unwrap();

        assert_eq!(msg.hostname.as_deref(), Some("UDM-Pro"));
        assert_eq!(msg.timestamp, Utc.with_ymd_and_hms(2026, 3, 3, 10, 23, 45).unwrap());
        match msg.event {
            ParsedEvent::Firewall(fw) => {
                assert_eq!(fw.rule_name.as_deref(), Some("WAN_IN-2000-B"));
                assert_eq!(fw.interface_in.as_deref(), Some("eth8"));
                assert_eq!(fw.interface_out.as_deref(), Some("br0"));
                assert_eq!(fw.src_ip, "203.0.113.5".parse::<IpAddr>().unwrap());
                assert_eq!(fw.protocol.as_deref(), Some("TCP"));
                assert_eq!(fw.src_port, Some(51234));
                assert_eq!(fw.dst_port, Some(22));
            }
            other => panic!("expected firewall event, got {:?}", other),
        }
    }

    #[test]
    fn test_reparse_is_identical() {
        let parser = MessageParser::default();
        let now = at(2026, 3, 3, 12);
        assert_eq!(parser.parse_at(FIREWALL, now).unwrap(), parser.parse_at(FIREWALL, now).unwrap());
    }

    #[test]
    fn test_rule_key_and_description() {
        let line = r#"Jun 10 08:00:00 gw kernel: RULE=LAN_LOCAL-ACCEPT DESCR="Allow mgmt IN=x" IN=br0 OUT= SRC=192.168.1.2 DST=192.168.1.1 PROTO=UDP SPT=5353 DPT=53"#;
        let msg = MessageParser::default().parse_at(line, at(2026, 6, 10, 9)).unwrap();
        match msg.event {
            ParsedEvent::Firewall(fw) => {
                assert_eq!(fw.rule_name.as_deref(), Some("LAN_LOCAL-ACCEPT"));
                assert_eq!(fw.rule_desc.as_deref(), Some("Allow mgmt IN=x"));
                assert_eq!(fw.interface_in.as_deref(), Some("br0"));
                assert_eq!(fw.interface_out, None);
            }
            other => panic!("expected firewall event, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_address_rejects_event() {
        let line = "Mar  3 10:23:45 gw kernel: [WAN_IN-2000-D]IN=eth8 OUT=br0 SRC=203.0.113.500 DST=192.168.1.50 PROTO=TCP";
        let err = MessageParser::default().parse_at(line, at(2026, 3, 3, 12)).unwrap_err();
        assert!(matches!(err, ParseFailure::InvalidAddress { field: "SRC", .. }));
    }

    #[test]
    fn test_december_line_in_january_is_previous_year() {
        let line = "Dec 31 23:59:50 gw dnsmasq[123]: query[A] example.com from 192.168.1.20";
        let msg = MessageParser::default().parse_at(line, at(2027, 1, 1, 0)).unwrap();
        assert_eq!(msg.timestamp.year(), 2026);
    }

    #[test]
    fn test_slightly_future_line_keeps_current_year() {
        let line = "Mar  3 14:00:00 gw dnsmasq[123]: query[A] example.com from 192.168.1.20";
        let msg = MessageParser::default().parse_at(line, at(2026, 3, 3, 12)).unwrap();
        assert_eq!(msg.timestamp, at(2026, 3, 3, 14));
    }

    #[test]
    fn test_source_offset_is_applied() {
        let line = "Mar  3 14:00:00 gw dnsmasq[123]: query[A] example.com from 192.168.1.20";
        let msg = MessageParser::new(120).parse_at(line, at(2026, 3, 3, 12)).unwrap();
        assert_eq!(msg.timestamp, at(2026, 3, 3, 12));
    }

    #[test]
    fn test_dhcp_ack() {
        let line = "Mar  3 10:00:00 gw dnsmasq-dhcp[812]: DHCPACK(br0) 192.168.1.20 AA:BB:CC:DD:EE:01 laptop";
        let msg = MessageParser::default().parse_at(line, at(2026, 3, 3, 12)).unwrap();
        assert_eq!(
            msg.event,
            ParsedEvent::Dhcp(DhcpEvent {
                event: "DHCPACK".to_string(),
                interface: Some("br0".to_string()),
                ip: Some("192.168.1.20".parse().unwrap()),
                mac: Some("aa:bb:cc:dd:ee:01".to_string()),
                hostname: Some("laptop".to_string()),
            })
        );
    }

    #[test]
    fn test_wifi_association() {
        let line = "Mar  3 10:00:00 ap hostapd: ath0: STA 11:22:33:44:55:66 IEEE 802.11: disassociated";
        let msg = MessageParser::default().parse_at(line, at(2026, 3, 3, 12)).unwrap();
        match msg.event {
            ParsedEvent::Wifi(w) => {
                assert_eq!(w.event, "disassociated");
                assert_eq!(w.interface.as_deref(), Some("ath0"));
            }
            other => panic!("expected wifi event, got {:?}", other),
        }
    }

    #[test]
    fn test_dns_lines() {
        let parser = MessageParser::default();
        let now = at(2026, 3, 3, 12);

        let fwd = parser
            .parse_at("Mar  3 10:00:00 gw dnsmasq[1]: forwarded example.com to 1.1.1.1", now)
            .unwrap();
        assert!(matches!(fwd.event, ParsedEvent::Dns(ref d) if d.action == "forwarded"));

        let reply = parser
            .parse_at("Mar  3 10:00:00 gw dnsmasq[1]: reply example.com is 93.184.216.34", now)
            .unwrap();
        match reply.event {
            ParsedEvent::Dns(d) => assert_eq!(d.answer.as_deref(), Some("93.184.216.34")),
            other => panic!("expected dns event, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_line_becomes_system() {
        let line = "Mar  3 10:00:00 gw mcad: mcad[2345]: ace_reporter.reporter_fail(): initial contact failed";
        let msg = MessageParser::default().parse_at(line, at(2026, 3, 3, 12)).unwrap();
        assert_eq!(msg.event, ParsedEvent::System);
        assert_eq!(msg.raw, line);
    }

    #[test]
    fn test_headerless_line_uses_receive_time() {
        let now = at(2026, 3, 3, 12);
        let msg = MessageParser::default().parse_at("something odd happened", now).unwrap();
        assert_eq!(msg.timestamp, now);
        assert_eq!(msg.hostname, None);
    }

    #[test]
    fn test_empty_datagram() {
        assert_eq!(MessageParser::default().parse("  \n"), Err(ParseFailure::Empty));
    }
}
