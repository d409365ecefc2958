//! Shard admission controller.
//!
//! `assign` binds an account to the active shard with the most free slots.
//! When every shard is full it clears bindings idle for longer than the
//! inactivity threshold and retries once; if that frees nothing usable it
//! escalates to the operators and fails with `CapacityExhausted`.
//!
//! Every decision that reads the cache and then moves it runs under one
//! async lock, so concurrent assigns cannot oversubscribe a shard. A new
//! binding is only written after its shard's counter was raised, and the
//! counter is lowered again if the write fails.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use metrics::counter;
use shardgate_core::metrics::{SHARD_ASSIGNMENTS_TOTAL, SHARD_ESCALATIONS_TOTAL, SHARD_EVICTIONS_TOTAL};
use shardgate_core::payloads::{AdminNotice, SHARDS_FULL};
use shardgate_core::{AccountId, GatewayError, Result, ShardId};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::CapacityCache;
use crate::escalation::EscalationSink;
use crate::repository::ShardRepository;
use crate::types::{Assignment, EvictionReport, ShardCapacity, ShardRecord};

/// Default idle time after which a binding may be evicted.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Eviction reason recorded when `assign` finds no room.
pub const NO_AVAILABLE_SHARDS: &str = "NO_AVAILABLE_SHARDS";

/// Assigns accounts to shards under a hard per-shard ceiling.
pub struct ShardAdmission {
    repo: Arc<dyn ShardRepository>,
    cache: Arc<dyn CapacityCache>,
    escalation: Arc<dyn EscalationSink>,
    inactivity_threshold: Duration,
    lock: Mutex<()>,
}

impl ShardAdmission {
    /// Controller over `repo` and `cache`, escalating through `escalation`.
    pub fn new(
        repo: Arc<dyn ShardRepository>,
        cache: Arc<dyn CapacityCache>,
        escalation: Arc<dyn EscalationSink>,
    ) -> Self {
        Self {
            repo,
            cache,
            escalation,
            inactivity_threshold: DEFAULT_INACTIVITY_THRESHOLD,
            lock: Mutex::new(()),
        }
    }

    /// Override the idle time after which bindings may be evicted.
    #[must_use]
    pub fn with_inactivity_threshold(mut self, threshold: Duration) -> Self {
        self.inactivity_threshold = threshold;
        self
    }

    /// Configured inactivity threshold.
    pub fn inactivity_threshold(&self) -> Duration {
        self.inactivity_threshold
    }

    /// Bind `account` to a shard.
    ///
    /// An account that is already bound gets its binding back with
    /// `is_new_assignment = false` and the cache is left alone.
    #[instrument(skip_all, fields(account_id = %account))]
    pub async fn assign(&self, account: &AccountId, preferred: Option<&ShardId>) -> Result<Assignment> {
        let _guard = self.lock.lock().await;

        if let Some(binding) = self.repo.get_binding(account).await? {
            debug!(shard_id = %binding.shard_id, "account already bound");
            return Ok(Assignment {
                shard_id: binding.shard_id,
                account_id: account.clone(),
                is_new_assignment: false,
            });
        }

        let mut chosen = self.select(preferred).await?;
        if chosen.is_none() {
            warn!("no shard has free capacity, evicting inactive bindings");
            let report = self.evict_locked(NO_AVAILABLE_SHARDS).await?;
            if report.total_cleared > 0 {
                chosen = self.select(None).await?;
            }
        }

        let Some(shard) = chosen else {
            error!("every shard is full of active accounts");
            self.escalate().await;
            return Err(GatewayError::capacity_exhausted(
                "no shard has free capacity after evicting inactive accounts",
            ));
        };

        // counter first: a failed increment leaves no binding behind, a failed
        // binding write is undone on the counter
        let count = self.cache.increment(&shard).await?;
        if let Err(err) = self.repo.upsert_binding(account, &shard, Utc::now()).await {
            if let Err(rollback) = self.cache.decrement(&shard).await {
                error!(shard_id = %shard, error = %rollback, "failed to roll back capacity increment");
            }
            return Err(err);
        }
        counter!(SHARD_ASSIGNMENTS_TOTAL).increment(1);
        info!(shard_id = %shard, players = count, "account assigned");
        Ok(Assignment {
            shard_id: shard,
            account_id: account.clone(),
            is_new_assignment: true,
        })
    }

    /// Clear every binding idle for longer than the threshold.
    pub async fn evict_inactive(&self, reason: &str) -> Result<EvictionReport> {
        let _guard = self.lock.lock().await;
        self.evict_locked(reason).await
    }

    /// Unbind `account`. Returns `false` if it was not bound.
    #[instrument(skip_all, fields(account_id = %account))]
    pub async fn release(&self, account: &AccountId) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let cleared = self.repo.clear_bindings(std::slice::from_ref(account)).await?;
        let Some(binding) = cleared.into_iter().next() else {
            return Ok(false);
        };
        let _ = self.cache.decrement(&binding.shard_id).await?;
        info!(shard_id = %binding.shard_id, "account released");
        Ok(true)
    }

    /// Record activity for `account`. Returns `false` if it is not bound.
    pub async fn touch(&self, account: &AccountId) -> Result<bool> {
        self.repo.touch(account, Utc::now()).await
    }

    /// Register or update a shard. Deactivate with `is_active = false`.
    pub async fn save_shard(&self, record: ShardRecord) -> Result<ShardRecord> {
        if record.shard_id.is_empty() {
            return Err(GatewayError::invalid_params("shardId must not be empty"));
        }
        let _guard = self.lock.lock().await;
        let created = self.repo.upsert_shard(record.clone()).await?;
        if created {
            let bound = self.repo.count_bindings(&record.shard_id).await?;
            self.cache.set(&record.shard_id, bound).await?;
        }
        info!(shard_id = %record.shard_id, max_players = record.max_players, is_active = record.is_active, created, "shard saved");
        Ok(self.repo.get_shard(&record.shard_id).await?.unwrap_or(record))
    }

    /// Overwrite each shard's cached count with its durable binding count.
    /// Returns the shards whose count changed.
    pub async fn reconcile(&self) -> Result<Vec<ShardId>> {
        let _guard = self.lock.lock().await;
        let mut corrected = Vec::new();
        for shard in self.repo.list_shards().await? {
            let durable = self.repo.count_bindings(&shard.shard_id).await?;
            let cached = self.cache.get(&shard.shard_id).await?;
            if durable != cached {
                warn!(shard_id = %shard.shard_id, cached, durable, "capacity cache diverged, correcting");
                self.cache.set(&shard.shard_id, durable).await?;
                corrected.push(shard.shard_id);
            }
        }
        Ok(corrected)
    }

    /// Capacity of every shard.
    pub async fn snapshot(&self) -> Result<Vec<ShardCapacity>> {
        let mut out = Vec::new();
        for shard in self.repo.list_shards().await? {
            let current_players = self.cache.get(&shard.shard_id).await?;
            out.push(ShardCapacity {
                shard_id: shard.shard_id,
                max_players: shard.max_players,
                current_players,
                is_active: shard.is_active,
            });
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Internals (caller holds the lock)
    // ─────────────────────────────────────────────────────────────────────

    async fn select(&self, preferred: Option<&ShardId>) -> Result<Option<ShardId>> {
        let shards = self.repo.list_shards().await?;

        if let Some(preferred) = preferred {
            if let Some(shard) = shards.iter().find(|s| s.is_active && &s.shard_id == preferred) {
                if self.cache.get(&shard.shard_id).await? < shard.max_players {
                    return Ok(Some(shard.shard_id.clone()));
                }
                debug!(shard_id = %preferred, "preferred shard is full");
            }
        }

        let mut best: Option<(ShardId, i64)> = None;
        for shard in shards.into_iter().filter(|s| s.is_active) {
            let current = self.cache.get(&shard.shard_id).await?;
            let free = i64::from(shard.max_players) - i64::from(current);
            if free <= 0 {
                continue;
            }
            if best.as_ref().is_none_or(|(_, most)| free > *most) {
                best = Some((shard.shard_id, free));
            }
        }
        Ok(best.map(|(id, _)| id))
    }

    async fn evict_locked(&self, reason: &str) -> Result<EvictionReport> {
        let threshold = TimeDelta::from_std(self.inactivity_threshold)
            .map_err(|e| GatewayError::invalid_params(format!("inactivity threshold out of range: {e}")))?;
        let Some(cutoff) = Utc::now().checked_sub_signed(threshold) else {
            return Ok(EvictionReport::default());
        };

        let inactive = self.repo.find_inactive(cutoff).await?;
        if inactive.is_empty() {
            info!(reason, "no inactive bindings to evict");
            return Ok(EvictionReport::default());
        }

        let accounts: Vec<AccountId> = inactive.into_iter().map(|b| b.account_id).collect();
        let cleared = self.repo.clear_bindings(&accounts).await?;

        let mut shards_impacted: BTreeMap<ShardId, u32> = BTreeMap::new();
        for binding in cleared {
            *shards_impacted.entry(binding.shard_id).or_insert(0) += 1;
        }
        let mut total_cleared = 0u32;
        for (shard, n) in &shards_impacted {
            let _ = self.cache.decrement_by(shard, *n).await?;
            total_cleared += n;
        }
        counter!(SHARD_EVICTIONS_TOTAL).increment(u64::from(total_cleared));
        info!(reason, total_cleared, shards = shards_impacted.len(), "evicted inactive bindings");
        Ok(EvictionReport {
            total_cleared,
            shards_impacted,
        })
    }

    async fn escalate(&self) {
        counter!(SHARD_ESCALATIONS_TOTAL).increment(1);
        let notice = AdminNotice {
            reason: SHARDS_FULL.to_owned(),
            message: "All shards are full of active players; add capacity.".to_owned(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.escalation.notify_admins(&notice).await {
            error!(error = %err, "failed to publish capacity escalation");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::DateTime;
    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::cache::MemoryCapacityCache;
    use crate::repository::InMemoryShardRepository;
    use crate::types::AccountShardBinding;

    #[derive(Default)]
    struct Recorder {
        notices: SyncMutex<Vec<AdminNotice>>,
        fail: bool,
    }

    #[async_trait]
    impl EscalationSink for Recorder {
        async fn notify_admins(&self, notice: &AdminNotice) -> Result<()> {
            self.notices.lock().push(notice.clone());
            if self.fail {
                return Err(GatewayError::connection("broker down"));
            }
            Ok(())
        }
    }

    struct Fixture {
        repo: Arc<InMemoryShardRepository>,
        cache: Arc<MemoryCapacityCache>,
        sink: Arc<Recorder>,
        admission: ShardAdmission,
    }

    fn fixture(shards: Vec<ShardRecord>) -> Fixture {
        fixture_with_sink(shards, Recorder::default())
    }

    fn fixture_with_sink(shards: Vec<ShardRecord>, sink: Recorder) -> Fixture {
        let repo = Arc::new(InMemoryShardRepository::with_shards(shards));
        let cache = Arc::new(MemoryCapacityCache::new());
        let sink = Arc::new(sink);
        let admission = ShardAdmission::new(repo.clone(), cache.clone(), sink.clone());
        Fixture {
            repo,
            cache,
            sink,
            admission,
        }
    }

    fn acct(s: &str) -> AccountId {
        AccountId::from(s)
    }

    async fn bind_idle(f: &Fixture, account: &str, shard: &str, hours_ago: i64) {
        f.repo.insert_binding(AccountShardBinding {
            account_id: acct(account),
            shard_id: ShardId::from(shard),
            last_activity_at: Utc::now() - TimeDelta::hours(hours_ago),
        });
        let _ = f.cache.increment(&ShardId::from(shard)).await.unwrap();
    }

    #[tokio::test]
    async fn assign_is_idempotent() {
        let f = fixture(vec![ShardRecord::new("s1", 10)]);
        let first = f.admission.assign(&acct("a"), None).await.unwrap();
        let second = f.admission.assign(&acct("a"), None).await.unwrap();
        assert!(first.is_new_assignment);
        assert!(!second.is_new_assignment);
        assert_eq!(first.shard_id, second.shard_id);
        assert_eq!(f.cache.get(&first.shard_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn picks_most_free_slots_with_first_found_ties() {
        let f = fixture(vec![
            ShardRecord::new("small", 2),
            ShardRecord::new("big", 5),
            ShardRecord::new("big2", 5),
        ]);
        let a = f.admission.assign(&acct("a"), None).await.unwrap();
        assert_eq!(a.shard_id.as_str(), "big");
        let b = f.admission.assign(&acct("b"), None).await.unwrap();
        assert_eq!(b.shard_id.as_str(), "big2");
    }

    #[tokio::test]
    async fn preferred_shard_wins_when_it_has_room() {
        let f = fixture(vec![ShardRecord::new("big", 10), ShardRecord::new("small", 1)]);
        let small = ShardId::from("small");
        let a = f.admission.assign(&acct("a"), Some(&small)).await.unwrap();
        assert_eq!(a.shard_id, small);
        // full now, falls back to the scan
        let b = f.admission.assign(&acct("b"), Some(&small)).await.unwrap();
        assert_eq!(b.shard_id.as_str(), "big");
    }

    #[tokio::test]
    async fn inactive_shards_are_never_chosen() {
        let f = fixture(vec![ShardRecord::new("off", 100).deactivated(), ShardRecord::new("on", 1)]);
        let off = ShardId::from("off");
        let a = f.admission.assign(&acct("a"), Some(&off)).await.unwrap();
        assert_eq!(a.shard_id.as_str(), "on");
    }

    #[tokio::test]
    async fn eviction_frees_exactly_the_inactive_bindings() {
        let f = fixture(vec![ShardRecord::new("s", 3)]);
        bind_idle(&f, "idle1", "s", 48).await;
        bind_idle(&f, "idle2", "s", 30).await;
        bind_idle(&f, "busy", "s", 1).await;

        let a = f.admission.assign(&acct("new"), None).await.unwrap();
        assert_eq!(a.shard_id.as_str(), "s");
        assert!(a.is_new_assignment);
        // 3 - 2 evicted + 1 assigned
        assert_eq!(f.cache.get(&ShardId::from("s")).await.unwrap(), 2);
        assert!(f.repo.get_binding(&acct("idle1")).await.unwrap().is_none());
        assert!(f.repo.get_binding(&acct("busy")).await.unwrap().is_some());
        assert!(f.sink.notices.lock().is_empty());

        let b = f.admission.assign(&acct("next"), None).await.unwrap();
        assert_eq!(b.shard_id.as_str(), "s");
    }

    #[tokio::test]
    async fn exhaustion_escalates_exactly_once() {
        let f = fixture(vec![ShardRecord::new("s", 1)]);
        bind_idle(&f, "busy", "s", 0).await;

        let res = f.admission.assign(&acct("new"), None).await;
        assert_matches!(res, Err(GatewayError::CapacityExhausted { ref code, .. }) if code == "SHARD_ASSIGNMENT_FAILED_NO_SPACE");
        let notices = f.sink.notices.lock();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].reason, SHARDS_FULL);
    }

    #[tokio::test]
    async fn failed_escalation_still_reports_capacity_exhausted() {
        let sink = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let f = fixture_with_sink(vec![], sink);
        let res = f.admission.assign(&acct("new"), None).await;
        assert_matches!(res, Err(GatewayError::CapacityExhausted { .. }));
        assert_eq!(f.sink.notices.lock().len(), 1);
    }

    #[tokio::test]
    async fn release_decrements_once() {
        let f = fixture(vec![ShardRecord::new("s", 2)]);
        let _ = f.admission.assign(&acct("a"), None).await.unwrap();
        assert!(f.admission.release(&acct("a")).await.unwrap());
        assert!(!f.admission.release(&acct("a")).await.unwrap());
        assert_eq!(f.cache.get(&ShardId::from("s")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn touch_protects_from_eviction() {
        let f = fixture(vec![ShardRecord::new("s", 1)]).admission_with_threshold(Duration::from_secs(3600));
        bind_idle(&f, "a", "s", 5).await;
        assert!(f.admission.touch(&acct("a")).await.unwrap());
        let report = f.admission.evict_inactive("MANUAL").await.unwrap();
        assert_eq!(report.total_cleared, 0);
    }

    #[tokio::test]
    async fn reconcile_trusts_durable_bindings() {
        let f = fixture(vec![ShardRecord::new("s", 5)]);
        let _ = f.admission.assign(&acct("a"), None).await.unwrap();
        f.cache.set(&ShardId::from("s"), 4).await.unwrap();
        let corrected = f.admission.reconcile().await.unwrap();
        assert_eq!(corrected, vec![ShardId::from("s")]);
        assert_eq!(f.cache.get(&ShardId::from("s")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn save_shard_rejects_empty_id_and_deactivates() {
        let f = fixture(vec![ShardRecord::new("s", 5)]);
        assert_matches!(
            f.admission.save_shard(ShardRecord::new("", 1)).await,
            Err(GatewayError::InvalidParams { .. })
        );
        let saved = f.admission.save_shard(ShardRecord::new("s", 5).deactivated()).await.unwrap();
        assert!(!saved.is_active);
        let snapshot = f.admission.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].is_active);
    }

    struct FlakyCache {
        inner: MemoryCapacityCache,
        fail_increments: AtomicU32,
    }

    impl FlakyCache {
        fn failing_next(n: u32) -> Self {
            Self {
                inner: MemoryCapacityCache::new(),
                fail_increments: AtomicU32::new(n),
            }
        }
    }

    #[async_trait]
    impl CapacityCache for FlakyCache {
        async fn get(&self, shard: &ShardId) -> Result<u32> {
            self.inner.get(shard).await
        }
        async fn increment(&self, shard: &ShardId) -> Result<u32> {
            let failing = self
                .fail_increments
                .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(GatewayError::connection("cache unreachable"));
            }
            self.inner.increment(shard).await
        }
        async fn decrement_by(&self, shard: &ShardId, n: u32) -> Result<u32> {
            self.inner.decrement_by(shard, n).await
        }
        async fn set(&self, shard: &ShardId, value: u32) -> Result<()> {
            self.inner.set(shard, value).await
        }
        async fn delete(&self, shard: &ShardId) -> Result<()> {
            self.inner.delete(shard).await
        }
    }

    #[tokio::test]
    async fn failed_increment_writes_no_binding() {
        let repo = Arc::new(InMemoryShardRepository::with_shards([ShardRecord::new("s", 1)]));
        let cache = Arc::new(FlakyCache::failing_next(1));
        let admission = ShardAdmission::new(repo.clone(), cache.clone(), Arc::new(Recorder::default()));

        assert_matches!(
            admission.assign(&acct("a"), None).await,
            Err(GatewayError::ConnectionFault { .. })
        );
        assert!(repo.get_binding(&acct("a")).await.unwrap().is_none());

        // the retry is a real assignment and fills the shard
        let again = admission.assign(&acct("a"), None).await.unwrap();
        assert!(again.is_new_assignment);
        assert_matches!(
            admission.assign(&acct("b"), None).await,
            Err(GatewayError::CapacityExhausted { .. })
        );
        assert_eq!(repo.binding_count(), 1);
        assert_eq!(cache.get(&ShardId::from("s")).await.unwrap(), 1);
    }

    struct UnwritableRepo(InMemoryShardRepository);

    #[async_trait]
    impl ShardRepository for UnwritableRepo {
        async fn list_shards(&self) -> Result<Vec<ShardRecord>> {
            self.0.list_shards().await
        }
        async fn get_shard(&self, shard: &ShardId) -> Result<Option<ShardRecord>> {
            self.0.get_shard(shard).await
        }
        async fn upsert_shard(&self, record: ShardRecord) -> Result<bool> {
            self.0.upsert_shard(record).await
        }
        async fn get_binding(&self, account: &AccountId) -> Result<Option<AccountShardBinding>> {
            self.0.get_binding(account).await
        }
        async fn upsert_binding(&self, _: &AccountId, _: &ShardId, _: DateTime<Utc>) -> Result<()> {
            Err(GatewayError::connection("repository unreachable"))
        }
        async fn touch(&self, account: &AccountId, at: DateTime<Utc>) -> Result<bool> {
            self.0.touch(account, at).await
        }
        async fn find_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<AccountShardBinding>> {
            self.0.find_inactive(cutoff).await
        }
        async fn clear_bindings(&self, accounts: &[AccountId]) -> Result<Vec<AccountShardBinding>> {
            self.0.clear_bindings(accounts).await
        }
        async fn count_bindings(&self, shard: &ShardId) -> Result<u32> {
            self.0.count_bindings(shard).await
        }
    }

    #[tokio::test]
    async fn failed_binding_write_rolls_back_the_counter() {
        let repo = Arc::new(UnwritableRepo(InMemoryShardRepository::with_shards([ShardRecord::new("s", 1)])));
        let cache = Arc::new(MemoryCapacityCache::new());
        let admission = ShardAdmission::new(repo, cache.clone(), Arc::new(Recorder::default()));

        for account in ["a", "b"] {
            assert_matches!(
                admission.assign(&acct(account), None).await,
                Err(GatewayError::ConnectionFault { .. })
            );
        }
        assert_eq!(cache.get(&ShardId::from("s")).await.unwrap(), 0);
    }

    impl Fixture {
        fn admission_with_threshold(self, threshold: Duration) -> Self {
            Self {
                admission: self.admission.with_inactivity_threshold(threshold),
                ..self
            }
        }
    }
}
