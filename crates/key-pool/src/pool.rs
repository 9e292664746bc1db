//! Credential state machine and rotation cursor
//!
//! The pool holds an ordered, insertion-stable list of API keys plus a
//! selection cursor. Exactly one key is selected at any time; the dispatcher
//! marks it in use, reports the outcome, and asks the pool to rotate when the
//! key hits its quota.
//!
//! Daily quota reset is lazy: every operation first moves each key whose
//! `last_reset_date` differs from today back to Available with its usage
//! counter and last error cleared. Re-running it on the same day is a no-op.
//!
//! Every mutation broadcasts a snapshot after the pool lock is released. Each
//! snapshot carries a version taken under the lock, so observers can drop
//! deliveries that arrive out of order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use common::Secret;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broadcast::{StatusBroadcaster, Subscription};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Longest diagnostic kept in `last_error`.
pub const MAX_ERROR_CHARS: usize = 50;

/// Diagnostic recorded when a key is exhausted by rate limiting.
pub const EXHAUSTED_MESSAGE: &str = "quota exhausted";

/// Runtime state of a pooled key.
///
/// Transitions:
/// - Available → InUse (dispatch attempt starts)
/// - InUse → Available (success, or transient failure)
/// - InUse → Exhausted (rate limited)
/// - InUse → Errored (rejected key, missing model, unexpected failure)
/// - Exhausted/Errored → Available (calendar date changes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Available,
    InUse,
    Exhausted,
    Errored,
}

impl CredentialState {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialState::Available => "available",
            CredentialState::InUse => "in_use",
            CredentialState::Exhausted => "exhausted",
            CredentialState::Errored => "errored",
        }
    }
}

/// One pooled API key and its usage state.
///
/// Serializes with the masked preview only; the secret itself is skipped.
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    #[serde(skip)]
    pub value: Secret<String>,
    pub masked: String,
    pub state: CredentialState,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_reset_date: NaiveDate,
    pub last_error: Option<String>,
}

impl Credential {
    fn new(value: String, today: NaiveDate) -> Self {
        let value = Secret::new(value);
        Self {
            masked: value.masked(),
            value,
            state: CredentialState::Available,
            usage_count: 0,
            last_used_at: None,
            last_reset_date: today,
            last_error: None,
        }
    }
}

/// Copy of every key's state plus the selected index, as delivered to observers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub credentials: Vec<Credential>,
    pub selected: usize,
    /// Increases by one with every pool mutation.
    pub version: u64,
}

impl StatusSnapshot {
    pub fn count(&self, state: CredentialState) -> usize {
        self.credentials.iter().filter(|c| c.state == state).count()
    }

    /// Pool health: all available → healthy, some available → degraded,
    /// none available → unhealthy.
    pub fn health_label(&self) -> &'static str {
        let available = self.count(CredentialState::Available);
        if available > 0 && available == self.credentials.len() {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }

    /// JSON health summary for the health endpoint.
    pub fn health(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.health_label(),
            "keys_total": self.credentials.len(),
            "keys_available": self.count(CredentialState::Available),
            "keys_in_use": self.count(CredentialState::InUse),
            "keys_exhausted": self.count(CredentialState::Exhausted),
            "keys_errored": self.count(CredentialState::Errored),
            "selected": self.selected,
            "keys": self.credentials,
        })
    }
}

struct PoolState {
    credentials: Vec<Credential>,
    cursor: usize,
    version: u64,
}

impl PoolState {
    /// Returns true if any key changed.
    fn apply_daily_reset(&mut self, today: NaiveDate) -> bool {
        let mut changed = false;
        for (index, credential) in self.credentials.iter_mut().enumerate() {
            if credential.last_reset_date == today {
                continue;
            }
            // An in-flight attempt resolves its own key's state
            if credential.state != CredentialState::InUse {
                credential.state = CredentialState::Available;
            }
            credential.usage_count = 0;
            credential.last_error = None;
            credential.last_reset_date = today;
            changed = true;
            debug!(index, key = %credential.masked, "daily quota reset");
        }
        changed
    }

    /// First Available key after `start` in circular order, never `start` itself.
    fn next_available_after(&self, start: usize) -> Option<usize> {
        let n = self.credentials.len();
        (1..n)
            .map(|offset| (start + offset) % n)
            .find(|&idx| self.credentials[idx].state == CredentialState::Available)
    }

    fn selected_mut(&mut self) -> &mut Credential {
        let cursor = self.cursor;
        &mut self.credentials[cursor]
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            credentials: self.credentials.clone(),
            selected: self.cursor,
            version: self.version,
        }
    }

    /// Snapshot of a mutation just applied.
    fn changed(&mut self) -> StatusSnapshot {
        self.version += 1;
        self.snapshot()
    }
}

/// Pool of API keys with a rotation cursor.
///
/// All operations are synchronous and short; the internal mutex is never held
/// across an await point or while observers run.
pub struct CredentialPool {
    state: Mutex<PoolState>,
    broadcaster: StatusBroadcaster,
    clock: Arc<dyn Clock>,
}

impl CredentialPool {
    /// Build a pool from configured keys. Blank entries are dropped; all keys
    /// start Available with the cursor on the first one.
    pub fn new(values: Vec<String>, clock: Arc<dyn Clock>) -> Result<Self> {
        let today = clock.today();
        let credentials: Vec<Credential> = values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| Credential::new(v, today))
            .collect();
        if credentials.is_empty() {
            return Err(Error::NoCredentials);
        }
        info!(keys = credentials.len(), "key pool initialized");
        Ok(Self {
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
                version: 0,
            }),
            broadcaster: StatusBroadcaster::new(),
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock and apply the daily reset, returning a snapshot if it changed anything.
    fn lock_fresh(&self) -> (MutexGuard<'_, PoolState>, Option<StatusSnapshot>) {
        let mut state = self.lock();
        let reset = if state.apply_daily_reset(self.clock.today()) {
            Some(state.changed())
        } else {
            None
        };
        (state, reset)
    }

    fn notify(&self, snapshots: impl IntoIterator<Item = StatusSnapshot>) {
        for snapshot in snapshots {
            self.broadcaster.broadcast(&snapshot);
        }
    }

    /// Secret of the selected key.
    pub fn current_credential(&self) -> Secret<String> {
        let (state, reset) = self.lock_fresh();
        let value = state.credentials[state.cursor].value.clone();
        drop(state);
        self.notify(reset);
        value
    }

    /// Mark the selected key InUse. Returns its index.
    pub fn mark_in_use(&self) -> usize {
        let (mut state, reset) = self.lock_fresh();
        let now = self.clock.now();
        let index = state.cursor;
        let credential = state.selected_mut();
        credential.state = CredentialState::InUse;
        credential.last_used_at = Some(now);
        debug!(index, key = %credential.masked, "key in use");
        let snapshot = state.changed();
        drop(state);
        self.notify(reset.into_iter().chain(Some(snapshot)));
        index
    }

    /// Return the selected key to Available and count one successful call.
    pub fn mark_success(&self) {
        let (mut state, reset) = self.lock_fresh();
        let now = self.clock.now();
        let index = state.cursor;
        let credential = state.selected_mut();
        credential.state = CredentialState::Available;
        credential.usage_count += 1;
        credential.last_used_at = Some(now);
        debug!(
            index,
            key = %credential.masked,
            usage = credential.usage_count,
            "key call succeeded"
        );
        let snapshot = state.changed();
        drop(state);
        self.notify(reset.into_iter().chain(Some(snapshot)));
    }

    /// Return the selected key to Available without counting a use.
    ///
    /// Used after transient upstream failures that say nothing about the key.
    pub fn release(&self) {
        let (mut state, reset) = self.lock_fresh();
        let index = state.cursor;
        let credential = state.selected_mut();
        credential.state = CredentialState::Available;
        debug!(index, key = %credential.masked, "key released");
        let snapshot = state.changed();
        drop(state);
        self.notify(reset.into_iter().chain(Some(snapshot)));
    }

    /// Mark the selected key Exhausted, then rotate the cursor to the next
    /// Available key in pool order.
    ///
    /// The scan starts just after the exhausted key, wraps at most once, and
    /// never revisits the starting index. Returns false (cursor unchanged)
    /// when no other key is Available.
    pub fn mark_exhausted_and_rotate(&self) -> bool {
        let (mut state, reset) = self.lock_fresh();
        let from = state.cursor;
        let credential = state.selected_mut();
        credential.state = CredentialState::Exhausted;
        credential.last_error = Some(EXHAUSTED_MESSAGE.to_string());
        info!(index = from, key = %credential.masked, "key exhausted (quota)");
        let mut snapshots: Vec<StatusSnapshot> = reset.into_iter().collect();
        snapshots.push(state.changed());

        let rotated = match state.next_available_after(from) {
            Some(to) => {
                state.cursor = to;
                info!(from, to, key = %state.credentials[to].masked, "rotated to next key");
                snapshots.push(state.changed());
                true
            }
            None => {
                warn!(index = from, "no available key to rotate to");
                false
            }
        };
        drop(state);
        self.notify(snapshots);
        rotated
    }

    /// Mark the selected key Errored with a diagnostic truncated to
    /// `MAX_ERROR_CHARS` characters.
    pub fn mark_error(&self, message: &str) {
        let (mut state, reset) = self.lock_fresh();
        let index = state.cursor;
        let credential = state.selected_mut();
        credential.state = CredentialState::Errored;
        credential.last_error = Some(message.chars().take(MAX_ERROR_CHARS).collect());
        warn!(index, key = %credential.masked, "key marked errored");
        let snapshot = state.changed();
        drop(state);
        self.notify(reset.into_iter().chain(Some(snapshot)));
    }

    /// Make sure the cursor points at an Available key, rotating forward past
    /// unusable ones. Returns false if none is Available (cursor unchanged).
    pub fn select_available(&self) -> bool {
        let (mut state, reset) = self.lock_fresh();
        let mut snapshots: Vec<StatusSnapshot> = reset.into_iter().collect();
        let from = state.cursor;
        let selected = if state.credentials[from].state == CredentialState::Available {
            true
        } else if let Some(to) = state.next_available_after(from) {
            state.cursor = to;
            info!(from, to, "selection moved to available key");
            snapshots.push(state.changed());
            true
        } else {
            false
        };
        drop(state);
        self.notify(snapshots);
        selected
    }

    /// True iff at least one key is Available.
    pub fn has_available(&self) -> bool {
        let (state, reset) = self.lock_fresh();
        let available = state
            .credentials
            .iter()
            .any(|c| c.state == CredentialState::Available);
        drop(state);
        self.notify(reset);
        available
    }

    /// Defensive copy of every key's state.
    pub fn snapshot(&self) -> Vec<Credential> {
        self.status().credentials
    }

    /// Keys and selected index from one consistent read.
    pub fn status(&self) -> StatusSnapshot {
        let (state, reset) = self.lock_fresh();
        let snapshot = state.snapshot();
        drop(state);
        self.notify(reset);
        snapshot
    }

    pub fn selected_index(&self) -> usize {
        self.lock().cursor
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    /// Always false: a pool is never constructed empty.
    pub fn is_empty(&self) -> bool {
        self.lock().credentials.is_empty()
    }

    /// Append a new Available key. Returns false if the key is already pooled.
    pub fn add_credential(&self, value: &str) -> Result<bool> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::BlankCredential);
        }
        let mut state = self.lock();
        if state.credentials.iter().any(|c| c.value.expose() == value) {
            return Ok(false);
        }
        let credential = Credential::new(value.to_string(), self.clock.today());
        info!(index = state.credentials.len(), key = %credential.masked, "key added to pool");
        state.credentials.push(credential);
        let snapshot = state.changed();
        drop(state);
        self.notify(Some(snapshot));
        Ok(true)
    }

    /// Remove the key at `index`, keeping the cursor on a valid entry.
    ///
    /// Removing a key before the cursor shifts the cursor down with it;
    /// removing the selected key selects whatever now sits at that index
    /// (clamped to the new last entry). A key with a call in flight cannot be
    /// removed, since its outcome must land on it.
    pub fn remove_credential(&self, index: usize) -> Result<Credential> {
        let mut state = self.lock();
        let len = state.credentials.len();
        if index >= len {
            return Err(Error::IndexOutOfRange { index, len });
        }
        if len == 1 {
            return Err(Error::LastCredential);
        }
        if state.credentials[index].state == CredentialState::InUse {
            return Err(Error::CredentialInUse { index });
        }
        let removed = state.credentials.remove(index);
        if index < state.cursor {
            state.cursor -= 1;
        }
        state.cursor = state.cursor.min(state.credentials.len() - 1);
        info!(index, key = %removed.masked, cursor = state.cursor, "key removed from pool");
        let snapshot = state.changed();
        drop(state);
        self.notify(Some(snapshot));
        Ok(removed)
    }

    /// Register an observer for every subsequent state change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 12, 9, 0, 0).unwrap(),
        ))
    }

    fn pool_with(keys: &[&str]) -> (CredentialPool, Arc<ManualClock>) {
        let clock = clock();
        let pool = CredentialPool::new(
            keys.iter().map(|k| k.to_string()).collect(),
            clock.clone(),
        )
        .unwrap();
        (pool, clock)
    }

    fn states(pool: &CredentialPool) -> Vec<CredentialState> {
        pool.snapshot().iter().map(|c| c.state).collect()
    }

    /// Count broadcasts delivered to a fresh subscriber.
    fn broadcast_counter(pool: &CredentialPool) -> Arc<Mutex<Vec<StatusSnapshot>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let _sub = pool.subscribe(move |s| recorder.lock().unwrap().push(s.clone()));
        seen
    }

    use CredentialState::{Available, Errored, Exhausted, InUse};

    #[test]
    fn new_filters_blank_entries() {
        let (pool, _) = pool_with(&["k1", "  ", "", "k2"]);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.current_credential().expose(), "k1");
    }

    #[test]
    fn new_rejects_all_blank() {
        let err = CredentialPool::new(vec![" ".into(), "".into()], clock()).err();
        assert!(matches!(err, Some(Error::NoCredentials)));
    }

    #[test]
    fn new_starts_available_at_index_zero() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"]);
        assert_eq!(pool.selected_index(), 0);
        assert_eq!(states(&pool), vec![Available; 3]);
        assert!(pool.has_available());
    }

    #[test]
    fn single_success_counts_usage_without_rotation() {
        let (pool, _) = pool_with(&["k1"]);
        pool.mark_in_use();
        assert_eq!(states(&pool), vec![InUse]);
        pool.mark_success();

        let snap = pool.snapshot();
        assert_eq!(snap[0].state, Available);
        assert_eq!(snap[0].usage_count, 1);
        assert!(snap[0].last_used_at.is_some());
        assert_eq!(pool.selected_index(), 0);
    }

    #[test]
    fn success_then_current_returns_same_credential() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        pool.mark_exhausted_and_rotate();
        pool.mark_in_use();
        let used = pool.current_credential();
        pool.mark_success();
        assert_eq!(pool.current_credential().expose(), used.expose());
        assert_eq!(used.expose(), "k2");
    }

    #[test]
    fn rotation_advances_in_pool_order() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"]);
        assert!(pool.mark_exhausted_and_rotate());
        assert_eq!(pool.selected_index(), 1);
        assert!(pool.mark_exhausted_and_rotate());
        assert_eq!(pool.selected_index(), 2);

        let snap = pool.snapshot();
        assert_eq!(snap[0].state, Exhausted);
        assert_eq!(snap[0].last_error.as_deref(), Some(EXHAUSTED_MESSAGE));
        assert_eq!(snap[2].state, Available);
    }

    #[test]
    fn rotation_skips_exhausted_and_errored_keys() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"]);
        pool.mark_exhausted_and_rotate(); // k1 exhausted → k2
        pool.mark_error("boom"); // k2 errored
        assert!(pool.select_available()); // → k3
        assert_eq!(pool.selected_index(), 2);
        pool.mark_in_use();
        pool.mark_success();

        assert!(!pool.mark_exhausted_and_rotate());
        assert_eq!(pool.selected_index(), 2);
        assert_eq!(states(&pool), vec![Exhausted, Errored, Exhausted]);
    }

    #[test]
    fn rotation_wraps_past_end_of_list() {
        let (pool, clock) = pool_with(&["k1", "k2", "k3"]);
        pool.mark_exhausted_and_rotate(); // k1 exhausted → 1
        pool.mark_exhausted_and_rotate(); // k2 exhausted → 2
        clock.advance(chrono::Duration::days(1));

        // Reset revives k1 and k2; rotating from k3 wraps to k1
        assert!(pool.mark_exhausted_and_rotate());
        assert_eq!(pool.selected_index(), 0);
    }

    #[test]
    fn single_key_rotation_always_false() {
        let (pool, _) = pool_with(&["only"]);
        assert!(!pool.mark_exhausted_and_rotate());
        assert_eq!(pool.selected_index(), 0);
        assert!(!pool.has_available());
    }

    #[test]
    fn n_keys_exhaust_after_n_rotations() {
        for n in 1..=6 {
            let keys: Vec<String> = (0..n).map(|i| format!("key-{i}")).collect();
            let pool = CredentialPool::new(keys, clock()).unwrap();
            let mut successes = 0;
            while pool.mark_exhausted_and_rotate() {
                successes += 1;
                assert!(successes < n, "rotated more than n-1 times");
            }
            assert_eq!(successes, n - 1);
            assert!(!pool.has_available());
        }
    }

    #[test]
    fn scan_skips_unusable_states_and_start_index() {
        let today = clock().today();
        let mut state = PoolState {
            credentials: ["k0", "k1", "k2", "k3"]
                .iter()
                .map(|k| Credential::new(k.to_string(), today))
                .collect(),
            cursor: 0,
            version: 0,
        };
        state.credentials[0].state = Exhausted;
        state.credentials[1].state = InUse;
        state.credentials[2].state = Errored;
        assert_eq!(state.next_available_after(0), Some(3));

        // The start index is never returned, even when Available
        state.credentials[3].state = Exhausted;
        state.credentials[0].state = Available;
        assert_eq!(state.next_available_after(0), None);

        // Scan order starts just after `start`
        state.credentials[1].state = Available;
        state.credentials[3].state = Available;
        assert_eq!(state.next_available_after(1), Some(3));
        assert_eq!(state.next_available_after(3), Some(0));
    }

    #[test]
    fn mark_error_truncates_message() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        let long = "E".repeat(500);
        pool.mark_error(&long);

        let snap = pool.snapshot();
        assert_eq!(snap[0].state, Errored);
        assert_eq!(
            snap[0].last_error.as_ref().unwrap().chars().count(),
            MAX_ERROR_CHARS
        );
        // Errored key does not move the cursor
        assert_eq!(pool.selected_index(), 0);
        assert_eq!(snap[1].state, Available);
    }

    #[test]
    fn mark_error_truncates_on_char_boundary() {
        let (pool, _) = pool_with(&["k1"]);
        pool.mark_error(&"é".repeat(80));
        let err = pool.snapshot()[0].last_error.clone().unwrap();
        assert_eq!(err.chars().count(), MAX_ERROR_CHARS);
    }

    #[test]
    fn release_does_not_count_usage() {
        let (pool, _) = pool_with(&["k1"]);
        pool.mark_in_use();
        pool.release();
        let snap = pool.snapshot();
        assert_eq!(snap[0].state, Available);
        assert_eq!(snap[0].usage_count, 0);
    }

    #[test]
    fn daily_reset_revives_exhausted_and_errored() {
        let (pool, clock) = pool_with(&["k1", "k2"]);
        pool.mark_in_use();
        pool.mark_success();
        pool.mark_exhausted_and_rotate(); // k1 exhausted → k2
        pool.mark_error("API_KEY_INVALID");
        assert!(!pool.has_available());

        clock.advance(chrono::Duration::days(1));

        assert!(pool.has_available());
        let snap = pool.snapshot();
        for c in &snap {
            assert_eq!(c.state, Available);
            assert_eq!(c.usage_count, 0);
            assert!(c.last_error.is_none());
            assert_eq!(c.last_reset_date, clock.today());
        }
    }

    #[test]
    fn daily_reset_is_idempotent_within_a_day() {
        let (pool, clock) = pool_with(&["k1", "k2"]);
        pool.mark_in_use();
        pool.mark_success();
        pool.mark_in_use();
        pool.mark_success();
        pool.mark_exhausted_and_rotate();

        clock.advance(chrono::Duration::hours(3));
        for _ in 0..5 {
            pool.has_available();
            pool.current_credential();
            pool.snapshot();
        }

        let snap = pool.snapshot();
        assert_eq!(snap[0].usage_count, 2);
        assert_eq!(snap[0].state, Exhausted);
        assert_eq!(snap[1].state, Available);
    }

    #[test]
    fn daily_reset_keeps_in_use_key_in_use() {
        let (pool, clock) = pool_with(&["k1", "k2"]);
        pool.mark_in_use();
        clock.advance(chrono::Duration::days(1));

        let snap = pool.snapshot();
        assert_eq!(snap[0].state, InUse);
        assert_eq!(snap[0].usage_count, 0);

        pool.mark_success();
        assert_eq!(pool.snapshot()[0].usage_count, 1);
    }

    #[test]
    fn snapshot_is_a_defensive_copy() {
        let (pool, _) = pool_with(&["k1"]);
        let mut snap = pool.snapshot();
        snap[0].state = Errored;
        snap[0].usage_count = 99;
        snap.clear();

        let fresh = pool.snapshot();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].state, Available);
        assert_eq!(fresh[0].usage_count, 0);
    }

    #[test]
    fn snapshot_serializes_masked_value_only() {
        let (pool, _) = pool_with(&["AIzaSyExampleSecretValue1234"]);
        let json = serde_json::to_string(&pool.status()).unwrap();
        assert!(!json.contains("AIzaSyExampleSecretValue1234"));
        assert!(json.contains("AIza…1234"));
        assert!(json.contains("\"state\":\"available\""));
    }

    #[test]
    fn select_available_moves_off_errored_key() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        pool.mark_error("not found");
        assert_eq!(pool.selected_index(), 0);
        assert!(pool.select_available());
        assert_eq!(pool.selected_index(), 1);
        assert_eq!(pool.current_credential().expose(), "k2");
    }

    #[test]
    fn select_available_keeps_available_cursor() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        assert!(pool.select_available());
        assert_eq!(pool.selected_index(), 0);
    }

    #[test]
    fn select_available_false_when_none() {
        let (pool, _) = pool_with(&["k1"]);
        pool.mark_error("denied");
        assert!(!pool.select_available());
        assert_eq!(pool.selected_index(), 0);
    }

    #[test]
    fn add_credential_appends_and_is_idempotent() {
        let (pool, _) = pool_with(&["k1"]);
        assert!(pool.add_credential(" k2 ").unwrap());
        assert!(!pool.add_credential("k2").unwrap());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.snapshot()[1].state, Available);
        assert!(matches!(
            pool.add_credential("   "),
            Err(Error::BlankCredential)
        ));
    }

    #[test]
    fn remove_before_cursor_shifts_cursor() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"]);
        pool.mark_exhausted_and_rotate();
        pool.mark_exhausted_and_rotate();
        assert_eq!(pool.selected_index(), 2);

        pool.remove_credential(0).unwrap();
        assert_eq!(pool.selected_index(), 1);
        assert_eq!(pool.current_credential().expose(), "k3");
    }

    #[test]
    fn remove_selected_last_entry_clamps_cursor() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"]);
        pool.mark_exhausted_and_rotate();
        pool.mark_exhausted_and_rotate();
        let removed = pool.remove_credential(2).unwrap();
        assert_eq!(removed.value.expose(), "k3");
        assert_eq!(pool.selected_index(), 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn remove_after_cursor_keeps_cursor() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"]);
        pool.remove_credential(2).unwrap();
        assert_eq!(pool.selected_index(), 0);
    }

    #[test]
    fn remove_rejects_out_of_range_and_last() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        assert!(matches!(
            pool.remove_credential(5),
            Err(Error::IndexOutOfRange { index: 5, len: 2 })
        ));
        pool.remove_credential(1).unwrap();
        assert!(matches!(
            pool.remove_credential(0),
            Err(Error::LastCredential)
        ));
    }

    #[test]
    fn remove_rejects_key_with_call_in_flight() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"]);
        pool.mark_in_use();
        assert!(matches!(
            pool.remove_credential(0),
            Err(Error::CredentialInUse { index: 0 })
        ));

        // The outcome still lands on the key that was called
        pool.mark_exhausted_and_rotate();
        let snap = pool.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].state, Exhausted);
        assert_eq!(snap[1].state, Available);
        assert_eq!(pool.selected_index(), 1);
    }

    #[test]
    fn remove_other_key_during_call_keeps_cursor_on_it() {
        let (pool, _) = pool_with(&["k1", "k2", "k3"]);
        pool.mark_exhausted_and_rotate();
        pool.mark_in_use();
        pool.remove_credential(0).unwrap();
        assert_eq!(pool.current_credential().expose(), "k2");
        pool.mark_success();
        assert_eq!(pool.snapshot()[0].usage_count, 1);
    }

    #[test]
    fn snapshot_versions_increase_per_mutation() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        let seen = broadcast_counter(&pool);
        pool.mark_in_use();
        pool.mark_success();
        pool.mark_exhausted_and_rotate();
        pool.add_credential("k3").unwrap();

        let versions: Vec<u64> = seen.lock().unwrap().iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
        // Reads report the latest version without bumping it
        assert_eq!(pool.status().version, 5);
        assert_eq!(pool.status().version, 5);
    }

    #[test]
    fn every_mutation_broadcasts() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        let seen = broadcast_counter(&pool);

        pool.mark_in_use();
        pool.mark_success();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(seen.lock().unwrap()[0].credentials[0].state, InUse);
        assert_eq!(seen.lock().unwrap()[1].credentials[0].state, Available);

        // Mark + rotate are two changes
        pool.mark_exhausted_and_rotate();
        let snaps = seen.lock().unwrap().clone();
        assert_eq!(snaps.len(), 4);
        assert_eq!(snaps[2].selected, 0);
        assert_eq!(snaps[2].credentials[0].state, Exhausted);
        assert_eq!(snaps[3].selected, 1);

        pool.mark_error("x");
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[test]
    fn failed_rotation_broadcasts_state_change_only() {
        let (pool, _) = pool_with(&["k1"]);
        let seen = broadcast_counter(&pool);
        assert!(!pool.mark_exhausted_and_rotate());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn reads_do_not_broadcast_without_changes() {
        let (pool, _) = pool_with(&["k1"]);
        let seen = broadcast_counter(&pool);
        pool.has_available();
        pool.current_credential();
        pool.snapshot();
        pool.selected_index();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn observer_can_read_pool_during_broadcast() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        let pool = Arc::new(pool);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&pool);
        let recorder = observed.clone();
        let _sub = pool.subscribe(move |_| {
            if let Some(pool) = weak.upgrade() {
                recorder.lock().unwrap().push(pool.selected_index());
            }
        });

        pool.mark_exhausted_and_rotate();
        assert_eq!(*observed.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn health_labels() {
        let (pool, _) = pool_with(&["k1", "k2"]);
        assert_eq!(pool.status().health_label(), "healthy");
        pool.mark_exhausted_and_rotate();
        assert_eq!(pool.status().health_label(), "degraded");
        pool.mark_exhausted_and_rotate();
        let health = pool.status().health();
        assert_eq!(health["status"], "unhealthy");
        assert_eq!(health["keys_exhausted"], 2);
        assert_eq!(health["keys_total"], 2);
    }
}
