//! Per-address login lockout and write-API throttling.
//!
//! Both tables are bounded: once more than `max_tracked` addresses are held,
//! the entry tracked longest is evicted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const LOGIN_THRESHOLD: u32 = 5;
pub const LOGIN_BASE_LOCKOUT: Duration = Duration::from_secs(60);
pub const LOGIN_MAX_LOCKOUT: Duration = Duration::from_secs(15 * 60);
pub const MAX_TRACKED_ADDRESSES: usize = 10_000;

/// Failures older than this with no active lockout are swept.
const LOGIN_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Lockout length after `failures` consecutive failures, if any.
pub fn lockout_for(failures: u32) -> Option<Duration> {
    if failures < LOGIN_THRESHOLD {
        return None;
    }
    let exponent = (failures - LOGIN_THRESHOLD).min(16);
    let lockout = LOGIN_BASE_LOCKOUT.saturating_mul(1u32 << exponent);
    Some(lockout.min(LOGIN_MAX_LOCKOUT))
}

#[derive(Debug, Clone)]
struct LoginEntry {
    failures: u32,
    locked_until: Option<Instant>,
    last_failure: Instant,
    first_seen: Instant,
}

/// Exponential-backoff lockout for failed logins.
#[derive(Debug)]
pub struct LoginLimiter {
    entries: Mutex<HashMap<String, LoginEntry>>,
    max_tracked: usize,
}

impl Default for LoginLimiter {
    fn default() -> Self {
        Self::new(MAX_TRACKED_ADDRESSES)
    }
}

impl LoginLimiter {
    pub fn new(max_tracked: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_tracked: max_tracked.max(1),
        }
    }

    /// Remaining lockout for this address, if it is currently locked out.
    pub fn retry_after(&self, client: &str, now: Instant) -> Option<Duration> {
        let entries = self.lock();
        let until = entries.get(client)?.locked_until?;
        (until > now).then(|| until - now)
    }

    /// Record a failure; returns the lockout now in force, if any.
    pub fn record_failure(&self, client: &str, now: Instant) -> Option<Duration> {
        let mut entries = self.lock();
        if !entries.contains_key(client) && entries.len() >= self.max_tracked {
            evict_oldest(&mut entries, |e| e.first_seen);
        }
        let entry = entries.entry(client.to_string()).or_insert(LoginEntry {
            failures: 0,
            locked_until: None,
            last_failure: now,
            first_seen: now,
        });
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure = now;
        let lockout = lockout_for(entry.failures);
        if let Some(lockout) = lockout {
            entry.locked_until = Some(now + lockout);
        }
        lockout
    }

    pub fn clear(&self, client: &str) {
        self.lock().remove(client);
    }

    pub fn failures(&self, client: &str) -> u32 {
        self.lock().get(client).map(|e| e.failures).unwrap_or(0)
    }

    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            let locked = e.locked_until.is_some_and(|until| until > now);
            locked || now.duration_since(e.last_failure) < LOGIN_STALE_AFTER
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LoginEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    window_reset: Instant,
    first_seen: Instant,
}

/// Fixed-window throttle for state-changing API calls.
#[derive(Debug)]
pub struct ApiLimiter {
    entries: Mutex<HashMap<String, WindowEntry>>,
    max_requests: u32,
    window: Duration,
    max_tracked: usize,
}

impl ApiLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self::with_capacity(max_requests, window, MAX_TRACKED_ADDRESSES)
    }

    pub fn with_capacity(max_requests: u32, window: Duration, max_tracked: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_requests,
            window,
            max_tracked: max_tracked.max(1),
        }
    }

    /// Count a request. `Err` carries the time until the window resets.
    pub fn check(&self, client: &str, now: Instant) -> Result<(), Duration> {
        let mut entries = self.lock();
        if !entries.contains_key(client) && entries.len() >= self.max_tracked {
            evict_oldest(&mut entries, |e| e.first_seen);
        }
        let entry = entries.entry(client.to_string()).or_insert(WindowEntry {
            count: 0,
            window_reset: now + self.window,
            first_seen: now,
        });
        if now >= entry.window_reset {
            entry.count = 0;
            entry.window_reset = now + self.window;
        }
        if entry.count >= self.max_requests {
            return Err(entry.window_reset - now);
        }
        entry.count += 1;
        Ok(())
    }

    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.window_reset > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WindowEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn evict_oldest<T>(entries: &mut HashMap<String, T>, first_seen: impl Fn(&T) -> Instant) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, e)| first_seen(e))
        .map(|(k, _)| k.clone());
    if let Some(key) = oldest {
        entries.remove(&key);
    }
}

/// Round a remaining duration up to whole seconds for `Retry-After`.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
