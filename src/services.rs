//! Well-known service names by destination port and transport protocol

use phf::phf_map;

/// Keyed by `"<port>/<proto>"` with a lowercase protocol
static SERVICES: phf::Map<&'static str, &'static str> = phf_map! {
    "20/tcp" => "FTP Data",
    "21/tcp" => "FTP",
    "22/tcp" => "SSH",
    "23/tcp" => "Telnet",
    "25/tcp" => "SMTP",
    "53/tcp" => "DNS",
    "53/udp" => "DNS",
    "67/udp" => "DHCP Server",
    "68/udp" => "DHCP Client",
    "69/udp" => "TFTP",
    "80/tcp" => "HTTP",
    "110/tcp" => "POP3",
    "111/tcp" => "RPC",
    "111/udp" => "RPC",
    "123/udp" => "NTP",
    "135/tcp" => "MS RPC",
    "137/udp" => "NetBIOS Name",
    "138/udp" => "NetBIOS Datagram",
    "139/tcp" => "NetBIOS Session",
    "143/tcp" => "IMAP",
    "161/udp" => "SNMP",
    "162/udp" => "SNMP Trap",
    "179/tcp" => "BGP",
    "389/tcp" => "LDAP",
    "443/tcp" => "HTTPS",
    "443/udp" => "QUIC",
    "445/tcp" => "SMB",
    "465/tcp" => "SMTPS",
    "500/udp" => "IKE",
    "514/udp" => "Syslog",
    "515/tcp" => "LPD",
    "587/tcp" => "SMTP Submission",
    "631/tcp" => "IPP",
    "636/tcp" => "LDAPS",
    "853/tcp" => "DNS over TLS",
    "873/tcp" => "rsync",
    "993/tcp" => "IMAPS",
    "995/tcp" => "POP3S",
    "1194/udp" => "OpenVPN",
    "1433/tcp" => "MS SQL",
    "1521/tcp" => "Oracle",
    "1701/udp" => "L2TP",
    "1723/tcp" => "PPTP",
    "1883/tcp" => "MQTT",
    "1900/udp" => "SSDP",
    "2049/tcp" => "NFS",
    "2375/tcp" => "Docker",
    "3074/udp" => "Xbox Live",
    "3306/tcp" => "MySQL",
    "3389/tcp" => "RDP",
    "3478/udp" => "STUN",
    "4500/udp" => "IPsec NAT-T",
    "5060/udp" => "SIP",
    "5060/tcp" => "SIP",
    "5353/udp" => "mDNS",
    "5432/tcp" => "PostgreSQL",
    "5900/tcp" => "VNC",
    "6379/tcp" => "Redis",
    "8080/tcp" => "HTTP Alternate",
    "8443/tcp" => "HTTPS Alternate",
    "8883/tcp" => "MQTT over TLS",
    "9100/tcp" => "Printer",
    "10001/udp" => "UniFi Discovery",
    "27017/tcp" => "MongoDB",
    "51820/udp" => "WireGuard",
};

/// Service name for a destination port, `None` when unknown
pub fn service_name(port: u16, protocol: &str) -> Option<&'static str> {
    let key = format!("{}/{}", port, protocol.to_ascii_lowercase());
    SERVICES.get(key.as_str()).copied()
}
