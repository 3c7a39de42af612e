use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::config::SafetyConfig;
use crate::db::Database;

pub const WINDOW: Duration = Duration::from_secs(60 * 60);

pub const SETTING_MIN_DELAY: &str = "safety_min_delay";
pub const SETTING_MAX_DELAY: &str = "safety_max_delay";
pub const SETTING_ACTIONS_PER_HOUR: &str = "safety_actions_per_hour";
pub const SETTING_MESSAGES_PER_HOUR: &str = "safety_messages_per_hour";

/// Settings rows that seed the operator-tunable limits.
pub fn default_settings(config: &SafetyConfig) -> Vec<(&'static str, String)> {
    vec![
        (SETTING_MIN_DELAY, config.min_delay_ms.to_string()),
        (SETTING_MAX_DELAY, config.max_delay_ms.to_string()),
        (SETTING_ACTIONS_PER_HOUR, config.actions_per_hour.to_string()),
        (SETTING_MESSAGES_PER_HOUR, config.messages_per_hour.to_string()),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleKind {
    Message,
    Action,
    Pattern,
}

impl ThrottleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleKind::Message => "message",
            ThrottleKind::Action => "action",
            ThrottleKind::Pattern => "pattern",
        }
    }
}

impl std::fmt::Display for ThrottleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct ThrottleEntry {
    id: u64,
    at: Instant,
    kind: ThrottleKind,
}

/// A slot taken by [`SafetyThrottle::try_reserve`]; must be committed or cancelled.
#[derive(Debug)]
#[must_use]
pub struct Reservation {
    account_id: i64,
    kind: ThrottleKind,
    id: u64,
}

/// Ceilings and jitter bounds in effect for one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyLimits {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub actions_per_hour: usize,
    pub messages_per_hour: usize,
}

impl SafetyLimits {
    fn from_config(config: &SafetyConfig) -> Self {
        Self {
            min_delay_ms: config.min_delay_ms,
            max_delay_ms: config.max_delay_ms,
            actions_per_hour: config.actions_per_hour,
            messages_per_hour: config.messages_per_hour,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleStats {
    pub actions_last_hour: usize,
    pub messages_last_hour: usize,
    pub patterns_last_hour: usize,
    pub actions_limit: usize,
    pub messages_limit: usize,
}

/// Per-account rolling one-hour counters plus the humanizing delay source.
///
/// Entries live only in memory. Each logged action also writes an audit row
/// to `logs`, which is never read back for decisions. With a database the
/// `safety_*` settings are re-read on every decision and override the config.
pub struct SafetyThrottle {
    config: SafetyConfig,
    db: Option<Arc<Database>>,
    windows: Mutex<HashMap<i64, Vec<ThrottleEntry>>>,
    next_id: AtomicU64,
}

impl SafetyThrottle {
    pub fn new(config: SafetyConfig, db: Option<Arc<Database>>) -> Self {
        Self {
            config,
            db,
            windows: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn is_strict(&self) -> bool {
        self.config.strict
    }

    fn lock_windows(&self) -> MutexGuard<'_, HashMap<i64, Vec<ThrottleEntry>>> {
        match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current limits: stored settings where valid, config otherwise.
    pub fn limits(&self) -> SafetyLimits {
        let fallback = SafetyLimits::from_config(&self.config);
        let Some(db) = &self.db else {
            return fallback;
        };
        let read = |key: &str| match db.get_setting(key) {
            Ok(value) => value,
            Err(e) => {
                error!(key, "Failed to read safety setting: {e}");
                None
            }
        };
        let ceiling = |key: &str, default: usize| {
            read(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let delay = |key: &str| read(key).and_then(|v| v.trim().parse::<u64>().ok());
        let stored_delays = (delay(SETTING_MIN_DELAY), delay(SETTING_MAX_DELAY));
        let (min_delay_ms, max_delay_ms) = match stored_delays {
            (Some(min), Some(max)) if min <= max => (min, max),
            (Some(min), None) if min <= fallback.max_delay_ms => (min, fallback.max_delay_ms),
            (None, Some(max)) if fallback.min_delay_ms <= max => (fallback.min_delay_ms, max),
            _ => (fallback.min_delay_ms, fallback.max_delay_ms),
        };
        SafetyLimits {
            min_delay_ms,
            max_delay_ms,
            actions_per_hour: ceiling(SETTING_ACTIONS_PER_HOUR, fallback.actions_per_hour),
            messages_per_hour: ceiling(SETTING_MESSAGES_PER_HOUR, fallback.messages_per_hour),
        }
    }

    fn limit_for(limits: &SafetyLimits, kind: ThrottleKind) -> Option<usize> {
        match kind {
            ThrottleKind::Action => Some(limits.actions_per_hour),
            ThrottleKind::Message => Some(limits.messages_per_hour),
            ThrottleKind::Pattern => None,
        }
    }

    fn prune(entries: &mut Vec<ThrottleEntry>, now: Instant) {
        entries.retain(|e| now.saturating_duration_since(e.at) < WINDOW);
    }

    fn count(entries: &[ThrottleEntry], kind: ThrottleKind) -> usize {
        entries.iter().filter(|e| e.kind == kind).count()
    }

    fn has_room(
        limits: &SafetyLimits,
        account_id: i64,
        entries: &[ThrottleEntry],
        kind: ThrottleKind,
    ) -> bool {
        let Some(limit) = Self::limit_for(limits, kind) else {
            return true;
        };
        let used = Self::count(entries, kind);
        if used >= limit {
            warn!(account_id, kind = kind.as_str(), used, limit, "Throttle limit reached");
            return false;
        }
        true
    }

    pub fn can_perform_action(&self, account_id: i64, kind: ThrottleKind) -> bool {
        self.can_perform_action_at(account_id, kind, Instant::now())
    }

    /// Read-only check; prunes the window but does not take a slot.
    pub fn can_perform_action_at(&self, account_id: i64, kind: ThrottleKind, now: Instant) -> bool {
        let limits = self.limits();
        let mut windows = self.lock_windows();
        let entries = windows.entry(account_id).or_default();
        Self::prune(entries, now);
        Self::has_room(&limits, account_id, entries, kind)
    }

    pub fn log_action(&self, account_id: i64, kind: ThrottleKind) {
        self.log_action_at(account_id, kind, Instant::now());
    }

    pub fn log_action_at(&self, account_id: i64, kind: ThrottleKind, now: Instant) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_windows()
            .entry(account_id)
            .or_default()
            .push(ThrottleEntry { id, at: now, kind });
        self.audit(account_id, kind);
    }

    pub fn try_reserve(&self, account_id: i64, kind: ThrottleKind) -> Option<Reservation> {
        self.try_reserve_at(account_id, kind, Instant::now())
    }

    /// Check and take a slot under one lock.
    pub fn try_reserve_at(
        &self,
        account_id: i64,
        kind: ThrottleKind,
        now: Instant,
    ) -> Option<Reservation> {
        let limits = self.limits();
        let mut windows = self.lock_windows();
        let entries = windows.entry(account_id).or_default();
        Self::prune(entries, now);
        if !Self::has_room(&limits, account_id, entries, kind) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.push(ThrottleEntry { id, at: now, kind });
        Some(Reservation {
            account_id,
            kind,
            id,
        })
    }

    /// Keep the reserved slot and write its audit row.
    pub fn commit(&self, reservation: Reservation) {
        self.audit(reservation.account_id, reservation.kind);
    }

    /// Release a reserved slot that was never used.
    pub fn cancel(&self, reservation: Reservation) {
        if let Some(entries) = self.lock_windows().get_mut(&reservation.account_id) {
            entries.retain(|e| e.id != reservation.id);
        }
    }

    fn audit(&self, account_id: i64, kind: ThrottleKind) {
        let Some(db) = &self.db else {
            return;
        };
        if let Err(e) = db.log_event(
            Some(account_id),
            "info",
            "safety",
            &format!("Action performed: {kind}"),
            None,
        ) {
            error!(account_id, "Failed to write throttle audit row: {e}");
        }
    }

    /// Uniform draw in `[min_delay_ms, max_delay_ms]`, both ends inclusive.
    pub fn random_delay_ms(&self) -> u64 {
        let limits = self.limits();
        let (min, max) = (limits.min_delay_ms, limits.max_delay_ms);
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    pub fn random_delay(&self) -> Duration {
        Duration::from_millis(self.random_delay_ms())
    }

    pub fn account_stats(&self, account_id: i64) -> ThrottleStats {
        self.account_stats_at(account_id, Instant::now())
    }

    pub fn account_stats_at(&self, account_id: i64, now: Instant) -> ThrottleStats {
        let limits = self.limits();
        let mut windows = self.lock_windows();
        let entries = windows.entry(account_id).or_default();
        Self::prune(entries, now);
        ThrottleStats {
            actions_last_hour: Self::count(entries, ThrottleKind::Action),
            messages_last_hour: Self::count(entries, ThrottleKind::Message),
            patterns_last_hour: Self::count(entries, ThrottleKind::Pattern),
            actions_limit: limits.actions_per_hour,
            messages_limit: limits.messages_per_hour,
        }
    }

    pub fn reset_limits(&self, account_id: i64) {
        self.lock_windows().remove(&account_id);
    }

    /// Drop every window; used on orchestrator shutdown.
    pub fn clear(&self) {
        self.lock_windows().clear();
    }
}
