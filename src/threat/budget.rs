//! Cross-process API quota tracking
//!
//! The provider's rate-limit headers are the only source of truth. Every
//! permission check re-reads the shared state so that a second process
//! calling the API is seen immediately.

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error_handling::{ErrorContext, InsightResult};

/// Quota snapshot as last reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateBudgetState {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub blacklist_remaining: Option<u32>,
    pub blacklist_reset_at: Option<DateTime<Utc>>,
    /// Set from `Retry-After` on a 429 for the check endpoint
    pub paused_until: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Rate-limit headers of one API response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitInfo {
    /// Parse the `X-RateLimit-*` and `Retry-After` header values
    pub fn from_header_values(
        remaining: Option<&str>,
        reset: Option<&str>,
        retry_after: Option<&str>,
    ) -> Self {
        Self {
            remaining: remaining.and_then(|v| v.trim().parse().ok()),
            reset_at: reset
                .and_then(|v| v.trim().parse::<i64>().ok())
                .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single()),
            retry_after_secs: retry_after.and_then(|v| v.trim().parse().ok()),
        }
    }
}

/// Quotas reset at midnight UTC when the provider gives no reset time
fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = (now.timestamp().div_euclid(86_400) + 1) * 86_400;
    Utc.timestamp_opt(midnight, 0)
        .single()
        .unwrap_or(now + Duration::days(1))
}

impl RateBudgetState {
    pub fn lookups_allowed(&self, now: DateTime<Utc>) -> bool {
        if self.paused_until.map_or(false, |until| now < until) {
            return false;
        }
        quota_open(self.remaining, self.reset_at, now)
    }

    pub fn blacklist_allowed(&self, now: DateTime<Utc>) -> bool {
        quota_open(self.blacklist_remaining, self.blacklist_reset_at, now)
    }

    fn apply_lookup(&mut self, info: &RateLimitInfo, now: DateTime<Utc>) {
        if let Some(remaining) = info.remaining {
            self.remaining = Some(remaining);
            self.reset_at = info.reset_at.or_else(|| (remaining == 0).then(|| next_utc_midnight(now)));
        } else if info.reset_at.is_some() {
            self.reset_at = info.reset_at;
        }
        self.updated_at = Some(now);
    }

    /// Only `paused_until` carries the 429 window. The counters keep what the
    /// headers report, and an exhausted quota without a reset header reopens
    /// when the pause ends.
    fn apply_lookup_limited(&mut self, info: &RateLimitInfo, now: DateTime<Utc>) {
        let until = match (info.retry_after_secs, info.reset_at) {
            (Some(secs), _) => now + Duration::seconds(secs as i64),
            (None, Some(reset)) => reset,
            (None, None) => next_utc_midnight(now),
        };
        if let Some(remaining) = info.remaining {
            self.remaining = Some(remaining);
            self.reset_at = info.reset_at.or(Some(until));
        } else if info.reset_at.is_some() {
            self.reset_at = info.reset_at;
        }
        self.paused_until = Some(until);
        self.updated_at = Some(now);
    }

    fn apply_blacklist(&mut self, info: &RateLimitInfo, now: DateTime<Utc>) {
        if let Some(remaining) = info.remaining {
            self.blacklist_remaining = Some(remaining);
            self.blacklist_reset_at =
                info.reset_at.or_else(|| (remaining == 0).then(|| next_utc_midnight(now)));
        }
        self.updated_at = Some(now);
    }

    fn apply_blacklist_limited(&mut self, info: &RateLimitInfo, now: DateTime<Utc>) {
        self.blacklist_remaining = Some(0);
        self.blacklist_reset_at = Some(match (info.retry_after_secs, info.reset_at) {
            (Some(secs), _) => now + Duration::seconds(secs as i64),
            (None, Some(reset)) => reset,
            (None, None) => next_utc_midnight(now),
        });
        self.updated_at = Some(now);
    }
}

fn quota_open(remaining: Option<u32>, reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match remaining {
        Some(0) => reset_at.map_or(false, |reset| now >= reset),
        _ => true,
    }
}

/// Shared persistence for `RateBudgetState`
pub trait RateBudgetStore: Send + Sync {
    fn load(&self) -> InsightResult<RateBudgetState>;
    fn store(&self, state: &RateBudgetState) -> InsightResult<()>;

    /// Read, modify and write back as one step with respect to other writers
    fn update(&self, f: &mut dyn FnMut(&mut RateBudgetState)) -> InsightResult<RateBudgetState>;
}

/// JSON file replaced atomically on every write. Updates hold an exclusive
/// advisory lock on a sidecar `.lock` file, so processes sharing the path
/// serialize their read-modify-write cycles.
pub struct FileRateBudgetStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileRateBudgetStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn lock(&self) -> InsightResult<File> {
        std::fs::create_dir_all(self.dir())
            .with_io_context(|| format!("Failed to create budget directory {}", self.dir().display()))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_io_context(|| format!("Failed to open budget lock {}", self.lock_path.display()))?;
        file.lock_exclusive()
            .with_io_context(|| format!("Failed to lock {}", self.lock_path.display()))?;
        Ok(file)
    }
}

impl RateBudgetStore for FileRateBudgetStore {
    fn load(&self) -> InsightResult<RateBudgetState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RateBudgetState::default()),
            Err(e) => {
                return Err(e).with_io_context(|| format!("Failed to read budget file {}", self.path.display()))
            }
        };

        match serde_json::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                // A torn or hand-edited file must not stop lookups forever
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable budget file");
                Ok(RateBudgetState::default())
            }
        }
    }

    fn store(&self, state: &RateBudgetState) -> InsightResult<()> {
        let dir = self.dir();
        std::fs::create_dir_all(dir)
            .with_io_context(|| format!("Failed to create budget directory {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_io_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        let body = serde_json::to_vec_pretty(state).with_context(|| "Failed to encode budget state".to_string())?;
        tmp.write_all(&body)
            .with_io_context(|| "Failed to write budget state".to_string())?;
        tmp.as_file()
            .sync_all()
            .with_io_context(|| "Failed to sync budget state".to_string())?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_io_context(|| format!("Failed to replace budget file {}", self.path.display()))?;
        Ok(())
    }

    fn update(&self, f: &mut dyn FnMut(&mut RateBudgetState)) -> InsightResult<RateBudgetState> {
        // released when the handle drops
        let _guard = self.lock()?;
        let mut state = self.load()?;
        f(&mut state);
        self.store(&state)?;
        Ok(state)
    }
}

/// Budget store for tests and single-process setups
#[derive(Default)]
pub struct MemoryRateBudgetStore {
    state: Mutex<RateBudgetState>,
}

impl MemoryRateBudgetStore {
    pub fn new(state: RateBudgetState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl RateBudgetStore for MemoryRateBudgetStore {
    fn load(&self) -> InsightResult<RateBudgetState> {
        Ok(self.state.lock().clone())
    }

    fn store(&self, state: &RateBudgetState) -> InsightResult<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }

    fn update(&self, f: &mut dyn FnMut(&mut RateBudgetState)) -> InsightResult<RateBudgetState> {
        let mut state = self.state.lock();
        f(&mut state);
        Ok(state.clone())
    }
}

/// Quota gate consulted before every API call
#[derive(Clone)]
pub struct RateBudget {
    store: Arc<dyn RateBudgetStore>,
}

impl RateBudget {
    pub fn new(store: Arc<dyn RateBudgetStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRateBudgetStore::default()))
    }

    /// Current shared state; an unreadable store reads as "unknown quota"
    pub fn state(&self) -> RateBudgetState {
        self.store.load().unwrap_or_else(|e| {
            warn!(error = %e, code = e.error_code(), "Budget state unavailable");
            RateBudgetState::default()
        })
    }

    pub fn can_lookup(&self, now: DateTime<Utc>) -> bool {
        self.state().lookups_allowed(now)
    }

    pub fn can_pull_blacklist(&self, now: DateTime<Utc>) -> bool {
        self.state().blacklist_allowed(now)
    }

    pub fn record_lookup(&self, info: &RateLimitInfo, now: DateTime<Utc>) {
        self.update(|state| state.apply_lookup(info, now));
        debug!(remaining = ?info.remaining, "Recorded lookup quota");
    }

    pub fn record_lookup_limited(&self, info: &RateLimitInfo, now: DateTime<Utc>) {
        self.update(|state| state.apply_lookup_limited(info, now));
        info!(
            retry_after = ?info.retry_after_secs,
            "Threat lookups paused after rate limit response"
        );
    }

    pub fn record_blacklist(&self, info: &RateLimitInfo, now: DateTime<Utc>) {
        self.update(|state| state.apply_blacklist(info, now));
    }

    pub fn record_blacklist_limited(&self, info: &RateLimitInfo, now: DateTime<Utc>) {
        self.update(|state| state.apply_blacklist_limited(info, now));
        info!(retry_after = ?info.retry_after_secs, "Blacklist pulls paused after rate limit response");
    }

    fn update<F: FnMut(&mut RateBudgetState)>(&self, mut f: F) {
        if let Err(e) = self.store.update(&mut f) {
            warn!(error = %e, code = e.error_code(), "Failed to persist budget state");
        }
    }
}
