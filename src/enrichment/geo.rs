//! GeoIP and ASN resolution from local MaxMind databases
//!
//! Readers live behind an `ArcSwap` so a reload never blocks lookups.
//! Missing files are not an error; the affected fields stay empty.

use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    /// ISO 3166 alpha-2 code
    pub country: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub asn_number: Option<i64>,
    pub asn_name: Option<String>,
}

impl GeoInfo {
    pub fn is_empty(&self) -> bool {
        *self == GeoInfo::default()
    }
}

#[cfg(feature = "geoip")]
type Reader = Arc<maxminddb::Reader<Vec<u8>>>;

#[derive(Default)]
struct Databases {
    #[cfg(feature = "geoip")]
    city: Option<Reader>,
    #[cfg(feature = "geoip")]
    asn: Option<Reader>,
}

impl Databases {
    #[cfg(feature = "geoip")]
    fn open(city_path: Option<&PathBuf>, asn_path: Option<&PathBuf>) -> Self {
        let open = |path: Option<&PathBuf>, kind: &str| {
            let path = path?;
            match maxminddb::Reader::open_readfile(path) {
                Ok(reader) => {
                    info!(path = %path.display(), kind, "Loaded GeoIP database");
                    Some(Arc::new(reader))
                }
                Err(e) => {
                    warn!(path = %path.display(), kind, error = %e, "GeoIP database unavailable");
                    None
                }
            }
        };
        Self {
            city: open(city_path, "city"),
            asn: open(asn_path, "asn"),
        }
    }

    #[cfg(not(feature = "geoip"))]
    fn open(_city_path: Option<&PathBuf>, _asn_path: Option<&PathBuf>) -> Self {
        warn!("Built without the geoip feature, geo enrichment disabled");
        Self::default()
    }

    /// Fill each reader that failed to reopen from the previous generation
    #[cfg(feature = "geoip")]
    fn keep_missing_from(mut self, previous: &Databases) -> Self {
        let keep = |fresh: &mut Option<Reader>, old: &Option<Reader>, kind: &str| {
            if fresh.is_none() {
                if let Some(old) = old {
                    warn!(kind, "GeoIP reload failed, keeping the previous database");
                    *fresh = Some(old.clone());
                }
            }
        };
        keep(&mut self.city, &previous.city, "city");
        keep(&mut self.asn, &previous.asn, "asn");
        self
    }

    #[cfg(not(feature = "geoip"))]
    fn keep_missing_from(self, _previous: &Databases) -> Self {
        self
    }

    #[cfg(feature = "geoip")]
    fn is_loaded(&self) -> bool {
        self.city.is_some() || self.asn.is_some()
    }

    #[cfg(not(feature = "geoip"))]
    fn is_loaded(&self) -> bool {
        false
    }

    #[cfg(feature = "geoip")]
    fn lookup(&self, ip: IpAddr) -> GeoInfo {
        use maxminddb::geoip2;

        let mut info = GeoInfo::default();

        if let Some(reader) = &self.city {
            if let Ok(city) = reader.lookup::<geoip2::City>(ip) {
                info.country = city
                    .country
                    .and_then(|c| c.iso_code)
                    .map(str::to_string);
                info.city = city
                    .city
                    .and_then(|c| c.names)
                    .and_then(|names| names.get("en").map(|n| n.to_string()));
                if let Some(location) = city.location {
                    info.latitude = location.latitude;
                    info.longitude = location.longitude;
                }
            }
        }

        if let Some(reader) = &self.asn {
            if let Ok(asn) = reader.lookup::<geoip2::Asn>(ip) {
                info.asn_number = asn.autonomous_system_number.map(i64::from);
                info.asn_name = asn.autonomous_system_organization.map(str::to_string);
            }
        }

        info
    }

    #[cfg(not(feature = "geoip"))]
    fn lookup(&self, _ip: IpAddr) -> GeoInfo {
        GeoInfo::default()
    }
}

pub struct GeoResolver {
    city_path: Option<PathBuf>,
    asn_path: Option<PathBuf>,
    databases: ArcSwap<Databases>,
}

impl GeoResolver {
    pub fn open(city_path: Option<PathBuf>, asn_path: Option<PathBuf>) -> Self {
        let databases = Databases::open(city_path.as_ref(), asn_path.as_ref());
        Self {
            city_path,
            asn_path,
            databases: ArcSwap::from_pointee(databases),
        }
    }

    pub fn disabled() -> Self {
        Self {
            city_path: None,
            asn_path: None,
            databases: ArcSwap::from_pointee(Databases::default()),
        }
    }

    /// Re-read the database files and swap them in atomically. A file that
    /// cannot be opened leaves its previous reader in place.
    pub fn reload(&self) -> bool {
        let previous = self.databases.load();
        let databases =
            Databases::open(self.city_path.as_ref(), self.asn_path.as_ref()).keep_missing_from(&previous);
        let loaded = databases.is_loaded();
        self.databases.store(Arc::new(databases));
        info!(loaded, "GeoIP databases reloaded");
        loaded
    }

    pub fn is_available(&self) -> bool {
        self.databases.load().is_loaded()
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        let info = self.databases.load().lookup(ip);
        (!info.is_empty()).then_some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_resolver_yields_nothing() {
        let geo = GeoResolver::disabled();
        assert!(!geo.is_available());
        assert_eq!(geo.lookup("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn test_missing_files_are_not_fatal() {
        let geo = GeoResolver::open(
            Some(PathBuf::from("/nonexistent/GeoLite2-City.mmdb")),
            Some(PathBuf::from("/nonexistent/GeoLite2-ASN.mmdb")),
        );
        assert!(!geo.is_available());
        assert!(!geo.reload());
    }

    #[cfg(feature = "geoip")]
    #[test]
    fn test_reload_keeps_reader_when_file_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let city_path = dir.path().join("GeoLite2-City.mmdb");
        let resolver = GeoResolver {
            city_path: Some(city_path.clone()),
            asn_path: None,
            databases: ArcSwap::from_pointee(Databases::default()),
        };
        // stand-in for a reader that loaded at startup
        let loaded = Databases {
            city: Some(Arc::new(
                maxminddb::Reader::from_source(minimal_mmdb()).expect("minimal database"),
            )),
            asn: None,
        };
        resolver.databases.store(Arc::new(loaded));
        assert!(resolver.is_available());
        assert!(!city_path.exists());

        assert!(resolver.reload());
        assert!(resolver.is_available());
    }

    /// Smallest valid MaxMind DB: an empty IPv4 search tree plus metadata
    #[cfg(feature = "geoip")]
    fn minimal_mmdb() -> Vec<u8> {
        fn utf8(out: &mut Vec<u8>, s: &str) {
            out.push(0x40 | s.len() as u8);
            out.extend_from_slice(s.as_bytes());
        }
        fn uint16(out: &mut Vec<u8>, v: u16) {
            out.push(0xa2);
            out.extend_from_slice(&v.to_be_bytes());
        }
        fn uint32(out: &mut Vec<u8>, v: u32) {
            out.push(0xc4);
            out.extend_from_slice(&v.to_be_bytes());
        }

        // one node, both records pointing at "no data" (node_count)
        let mut db = vec![0, 0, 1, 0, 0, 1];
        db.extend_from_slice(&[0u8; 16]);
        db.extend_from_slice(b"\xab\xcd\xefMaxMind.com");

        db.push(0xe9); // map, 9 entries
        utf8(&mut db, "binary_format_major_version");
        uint16(&mut db, 2);
        utf8(&mut db, "binary_format_minor_version");
        uint16(&mut db, 0);
        utf8(&mut db, "build_epoch");
        // uint64 is an extended type: type byte 0x08 with size 8
        db.extend_from_slice(&[0x08, 0x02]);
        db.extend_from_slice(&1_700_000_000u64.to_be_bytes());
        utf8(&mut db, "database_type");
        utf8(&mut db, "Test-City");
        utf8(&mut db, "description");
        db.push(0xe0); // empty map
        utf8(&mut db, "ip_version");
        uint16(&mut db, 4);
        utf8(&mut db, "languages");
        db.extend_from_slice(&[0x00, 0x04]); // empty array
        utf8(&mut db, "node_count");
        uint32(&mut db, 1);
        utf8(&mut db, "record_size");
        uint16(&mut db, 24);
        db
    }
}
