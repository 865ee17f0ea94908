//! Reverse DNS through the system resolver

use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReverseDnsResolver {
    enabled: bool,
    timeout: Duration,
}

impl ReverseDnsResolver {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self { enabled, timeout }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::from_millis(0))
    }

    /// PTR name for `ip`, `None` on timeout, failure or a bare-address answer
    pub async fn resolve(&self, ip: IpAddr) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let task = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(name))) => {
                let name = name.trim_end_matches('.').to_string();
                (name != ip.to_string() && !name.is_empty()).then_some(name)
            }
            Ok(Ok(Err(e))) => {
                debug!(%ip, error = %e, "Reverse lookup failed");
                None
            }
            Ok(Err(e)) => {
                debug!(%ip, error = %e, "Reverse lookup task aborted");
                None
            }
            Err(_) => {
                debug!(%ip, timeout_ms = self.timeout.as_millis() as u64, "Reverse lookup timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_resolver_skips_lookup() {
        let rdns = ReverseDnsResolver::disabled();
        assert_eq!(rdns.resolve("127.0.0.1".parse().unwrap()).await, None);
    }
}
