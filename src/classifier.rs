//! Direction and action classification
//!
//! Pure functions of the parsed event and the static interface layout.

use std::collections::{HashMap, HashSet};

use crate::config::NetworkSettings;
use crate::models::{Action, Direction, LogRecord};
use crate::parsed_event::{ParsedEvent, ParsedMessage};
use crate::services::service_name;

/// Substrings that rule out an implicit allow
const NEGATIVE_MARKERS: &[&str] = &["DROP", "DENY", "BLOCK", "REJECT", "INVALID"];

/// Interface layout of the router
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    wan: HashSet<String>,
    lan: HashMap<String, String>,
    vpn: HashSet<String>,
    vpn_prefixes: Vec<String>,
}

impl NetworkConfig {
    pub fn new<W, V, P>(wan: W, lan: HashMap<String, String>, vpn: V, vpn_prefixes: P) -> Self
    where
        W: IntoIterator<Item = String>,
        V: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        Self {
            wan: wan.into_iter().collect(),
            lan,
            vpn: vpn.into_iter().collect(),
            vpn_prefixes: vpn_prefixes.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self::new(
            settings.wan_interfaces.iter().cloned(),
            settings.lan_interfaces.clone(),
            settings.vpn_interfaces.iter().cloned(),
            settings.vpn_prefixes.iter().cloned(),
        )
    }

    pub fn is_wan(&self, iface: &str) -> bool {
        self.wan.contains(iface)
    }

    /// Configured LAN labels plus any bridge interface
    pub fn is_lan(&self, iface: &str) -> bool {
        !self.is_wan(iface) && (self.lan.contains_key(iface) || iface.starts_with("br"))
    }

    pub fn is_vpn(&self, iface: &str) -> bool {
        self.vpn.contains(iface) || self.vpn_prefixes.iter().any(|p| iface.starts_with(p.as_str()))
    }

    pub fn lan_label(&self, iface: &str) -> Option<&str> {
        self.lan.get(iface).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub direction: Option<Direction>,
    pub action: Option<Action>,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    network: NetworkConfig,
}

impl Classifier {
    pub fn new(network: NetworkConfig) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn classify(&self, event: &ParsedEvent) -> Classification {
        match event {
            ParsedEvent::Firewall(fw) => Classification {
                direction: self.direction(fw.interface_in.as_deref(), fw.interface_out.as_deref()),
                action: fw.rule_name.as_deref().and_then(action_from_rule),
            },
            ParsedEvent::Dhcp(dhcp) => self.local_if_lan(dhcp.interface.as_deref()),
            ParsedEvent::Wifi(wifi) => self.local_if_lan(wifi.interface.as_deref()),
            // dnsmasq lines name no interface
            ParsedEvent::Dns(_) | ParsedEvent::System => Classification::default(),
        }
    }

    /// Lower a parsed message to a record carrying its classification
    pub fn to_record(&self, message: ParsedMessage) -> LogRecord {
        let classification = self.classify(&message.event);
        let mut record = message.into_record();

        record.direction = classification.direction;
        record.rule_action = classification.action;
        if let (Some(port), Some(proto)) = (record.dst_port, record.protocol.as_deref()) {
            record.service_name = service_name(port, proto).map(str::to_string);
        }
        record
    }

    fn local_if_lan(&self, iface: Option<&str>) -> Classification {
        Classification {
            direction: iface.filter(|i| self.network.is_lan(i)).map(|_| Direction::Local),
            action: None,
        }
    }

    pub fn direction(&self, iface_in: Option<&str>, iface_out: Option<&str>) -> Option<Direction> {
        let net = &self.network;
        if iface_in.map_or(false, |i| net.is_vpn(i)) || iface_out.map_or(false, |o| net.is_vpn(o)) {
            return Some(Direction::Vpn);
        }

        match (iface_in, iface_out) {
            (Some(i), Some(o)) => {
                if net.is_wan(i) && net.is_lan(o) {
                    Some(Direction::Inbound)
                } else if net.is_lan(i) && net.is_wan(o) {
                    Some(Direction::Outbound)
                } else if i == o {
                    Some(Direction::Local)
                } else if net.is_lan(i) && net.is_lan(o) {
                    Some(Direction::InterVlan)
                } else {
                    None
                }
            }
            (Some(i), None) if net.is_lan(i) => Some(Direction::Local),
            (Some(i), None) if net.is_wan(i) => Some(Direction::Inbound),
            (None, Some(o)) if net.is_lan(o) => Some(Direction::Local),
            (None, Some(o)) if net.is_wan(o) => Some(Direction::Outbound),
            _ => None,
        }
    }
}

fn token_action(token: &str) -> Option<Action> {
    match token {
        "A" | "ACCEPT" | "ALLOW" => Some(Action::Allow),
        "B" | "D" | "DROP" | "DENY" | "BLOCK" => Some(Action::Block),
        "R" | "REJECT" => Some(Action::Reject),
        "DNAT" | "SNAT" | "NAT" | "REDIRECT" | "MASQ" => Some(Action::Redirect),
        _ => None,
    }
}

/// Action encoded in a rule name such as `WAN_IN-2000-D`.
///
/// Tokens are scanned from the end since the action marker trails the rule
/// identifier. Without any known token the rule is an allow unless its name
/// contains a negative marker, in which case the action stays unknown.
pub fn action_from_rule(rule: &str) -> Option<Action> {
    let upper = rule.to_ascii_uppercase();
    let found = upper
        .split(|c: char| matches!(c, '-' | '_' | '[' | ']' | ' '))
        .filter(|t| !t.is_empty())
        .rev()
        .find_map(token_action);

    match found {
        Some(action) => Some(action),
        None if NEGATIVE_MARKERS.iter().any(|m| upper.contains(m)) => None,
        None => Some(Action::Allow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(NetworkConfig::new(
            vec!["eth8".to_string(), "ppp0".to_string()],
            HashMap::from([
                ("br0".to_string(), "Main LAN".to_string()),
                ("br20".to_string(), "IoT".to_string()),
            ]),
            vec![],
            vec!["wg".to_string(), "tun".to_string()],
        ))
    }

    #[test]
    fn test_direction_matrix() {
        let c = classifier();
        assert_eq!(c.direction(Some("eth8"), Some("br0")), Some(Direction::Inbound));
        assert_eq!(c.direction(Some("br0"), Some("ppp0")), Some(Direction::Outbound));
        assert_eq!(c.direction(Some("br0"), Some("br20")), Some(Direction::InterVlan));
        assert_eq!(c.direction(Some("br0"), Some("br0")), Some(Direction::Local));
        assert_eq!(c.direction(Some("br20"), None), Some(Direction::Local));
        assert_eq!(c.direction(Some("wg0"), Some("br0")), Some(Direction::Vpn));
        assert_eq!(c.direction(Some("br0"), Some("tun1")), Some(Direction::Vpn));
        assert_eq!(c.direction(Some("ppp0"), None), Some(Direction::Inbound));
        assert_eq!(c.direction(None, Some("eth8")), Some(Direction::Outbound));
        assert_eq!(c.direction(Some("eth3"), Some("eth4")), None);
        assert_eq!(c.direction(None, None), None);
    }

    #[test]
    fn test_action_markers() {
        assert_eq!(action_from_rule("WAN_IN-2000-D"), Some(Action::Block));
        assert_eq!(action_from_rule("WAN_IN-3001-B"), Some(Action::Block));
        assert_eq!(action_from_rule("LAN_IN-10000-A"), Some(Action::Allow));
        assert_eq!(action_from_rule("GUEST_IN-R"), Some(Action::Reject));
        assert_eq!(action_from_rule("PREROUTING-DNAT-5"), Some(Action::Redirect));
        assert_eq!(action_from_rule("[LAN_LOCAL-ACCEPT]"), Some(Action::Allow));
    }

    #[test]
    fn test_unknown_rule_without_negative_marker_is_allow() {
        assert_eq!(action_from_rule("WAN_LOCAL-RET-2147483647"), Some(Action::Allow));
    }

    #[test]
    fn test_unknown_rule_with_negative_marker_is_unknown() {
        assert_eq!(action_from_rule("AUTODROP-4000"), None);
        assert_eq!(action_from_rule("CustomBlocklist"), None);
    }

    #[test]
    fn test_unclassifiable_firewall_line_keeps_type_without_action() {
        let message = crate::parser::MessageParser::default()
            .parse("<4>Jan  5 10:00:00 gw kernel: [AUTODROP-4000]IN=eth8 OUT=br0 SRC=203.0.113.9 DST=192.168.1.20 LEN=40 PROTO=TCP SPT=4444 DPT=23")
            .unwrap();
        let record = classifier().to_record(message);

        assert_eq!(record.log_type, crate::models::LogType::Firewall);
        assert_eq!(record.rule_name.as_deref(), Some("AUTODROP-4000"));
        assert_eq!(record.rule_action, None);
        assert_eq!(record.direction, Some(Direction::Inbound));
        assert_eq!(record.src_ip, Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_non_firewall_local_on_lan() {
        let c = classifier();
        let dhcp = ParsedEvent::Dhcp(crate::parsed_event::DhcpEvent {
            event: "DHCPACK".to_string(),
            interface: Some("br0".to_string()),
            ip: None,
            mac: None,
            hostname: None,
        });
        assert_eq!(c.classify(&dhcp).direction, Some(Direction::Local));
        assert_eq!(c.classify(&dhcp).action, None);
        assert_eq!(c.classify(&ParsedEvent::System), Classification::default());
    }
}
