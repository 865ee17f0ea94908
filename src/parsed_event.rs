//! Parsed router events
//!
//! `ParsedEvent` is the tagged union produced by the parser, one variant per
//! recognised message family. The classifier matches on these variants and
//! `ParsedMessage::into_record` lowers them to the stored `LogRecord` shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::models::{LogRecord, LogType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParsedEvent {
    Firewall(FirewallEvent),
    Dhcp(DhcpEvent),
    Wifi(WifiEvent),
    Dns(DnsEvent),
    /// Anything not recognised; the raw text is kept on the message
    System,
}

/// iptables-style firewall log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallEvent {
    pub rule_name: Option<String>,
    pub rule_desc: Option<String>,
    pub interface_in: Option<String>,
    pub interface_out: Option<String>,
    pub mac: Option<String>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: Option<String>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// dnsmasq-dhcp lease event (`DHCPACK(br0) 192.168.1.20 aa:bb:.. laptop`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhcpEvent {
    pub event: String,
    pub interface: Option<String>,
    pub ip: Option<IpAddr>,
    pub mac: Option<String>,
    pub hostname: Option<String>,
}

/// Station association change reported by the access point daemons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiEvent {
    pub event: String,
    pub interface: Option<String>,
    pub mac: Option<String>,
}

/// dnsmasq resolver activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsEvent {
    /// `query`, `reply`, `forwarded` or `cached`
    pub action: String,
    pub query: String,
    pub query_type: Option<String>,
    pub answer: Option<String>,
    /// Client for queries, upstream server for forwards
    pub peer_ip: Option<IpAddr>,
}

impl ParsedEvent {
    pub fn log_type(&self) -> LogType {
        match self {
            ParsedEvent::Firewall(_) => LogType::Firewall,
            ParsedEvent::Dhcp(_) => LogType::Dhcp,
            ParsedEvent::Wifi(_) => LogType::Wifi,
            ParsedEvent::Dns(_) => LogType::Dns,
            ParsedEvent::System => LogType::System,
        }
    }
}

/// One successfully parsed datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub timestamp: DateTime<Utc>,
    pub hostname: Option<String>,
    pub program: Option<String>,
    pub raw: String,
    pub event: ParsedEvent,
}

impl ParsedMessage {
    /// Lower into a storable record. Classification and enrichment fields
    /// are left empty for later stages.
    pub fn into_record(self) -> LogRecord {
        let mut record = LogRecord {
            timestamp: self.timestamp,
            log_type: self.event.log_type(),
            raw_log: self.raw,
            hostname: self.hostname,
            ..LogRecord::default()
        };

        match self.event {
            ParsedEvent::Firewall(fw) => {
                record.src_ip = Some(fw.src_ip);
                record.dst_ip = Some(fw.dst_ip);
                record.src_port = fw.src_port;
                record.dst_port = fw.dst_port;
                record.protocol = fw.protocol;
                record.interface_in = fw.interface_in;
                record.interface_out = fw.interface_out;
                record.mac_address = fw.mac;
                record.rule_name = fw.rule_name;
                record.rule_desc = fw.rule_desc;
            }
            ParsedEvent::Dhcp(dhcp) => {
                record.src_ip = dhcp.ip;
                record.mac_address = dhcp.mac;
                record.interface_in = dhcp.interface;
                record.dhcp_event = Some(dhcp.event);
                record.dhcp_hostname = dhcp.hostname;
            }
            ParsedEvent::Wifi(wifi) => {
                record.mac_address = wifi.mac;
                record.interface_in = wifi.interface;
                record.wifi_event = Some(wifi.event);
            }
            ParsedEvent::Dns(dns) => {
                if dns.action == "forwarded" {
                    record.dst_ip = dns.peer_ip;
                } else {
                    record.src_ip = dns.peer_ip;
                }
                record.dns_query = Some(dns.query);
                record.dns_type = dns.query_type;
                record.dns_answer = dns.answer;
            }
            ParsedEvent::System => {}
        }

        record
    }
}
