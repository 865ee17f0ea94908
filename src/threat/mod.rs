//! Threat intelligence: quota tracking, provider client and the tiered cache

pub mod budget;
pub mod cache;
pub mod client;
pub mod memory;

pub use budget::{FileRateBudgetStore, MemoryRateBudgetStore, RateBudget, RateBudgetState, RateBudgetStore, RateLimitInfo};
pub use cache::ThreatCache;
pub use client::{AbuseIpDbApi, ApiOutcome, ApiResponse, BlacklistedIp, LookupResult, ThreatIntelApi, ThreatLookupClient};
pub use memory::TtlCache;
