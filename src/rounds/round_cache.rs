use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{oneshot, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::primitives::ndf::Ndf;
use crate::primitives::round::{RoundId, RoundInfo, RoundState};

/// How a round ended, as seen by someone waiting for it
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RoundOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// Waits for a round to reach a terminal state
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoundWatcher: Send + Sync + 'static {
    async fn wait_for_round(&self, round_id: RoundId, timeout: Duration) -> RoundOutcome;
}

struct CachedRound {
    round: RoundInfo,
    added: Instant,
}

#[derive(Default)]
struct CacheState {
    rounds: BTreeMap<RoundId, CachedRound>,
    last_update_id: u64,
    ndf: Option<Ndf>,
    ndf_hash: [u8; 32],
    /// rounds in state QUEUED, i.e. rounds a message can be sent in
    waiting: BTreeMap<RoundId, RoundInfo>,
    watchers: FxHashMap<RoundId, Vec<oneshot::Sender<RoundOutcome>>>,
}

impl CacheState {
    fn notify_watchers(&mut self, round: &RoundInfo) {
        let outcome = match round.state {
            RoundState::Completed => RoundOutcome::Completed,
            RoundState::Failed => RoundOutcome::Failed,
            _ => return,
        };
        if let Some(watchers) = self.watchers.remove(&round.id) {
            trace!("notifying {} watchers of round {}: {:?}", watchers.len(), round.id, outcome);
            for w in watchers {
                let _ = w.send(outcome);
            }
        }
    }
}

/// The client's view of recent rounds and the current NDF, updated by the network follower
///  and read by the senders and the round checker.
pub struct RoundCache {
    state: Mutex<CacheState>,
    round_queued: Notify,
    retention: Duration,
}

impl RoundCache {
    pub fn new(retention: Duration) -> RoundCache {
        RoundCache {
            state: Default::default(),
            round_queued: Notify::new(),
            retention,
        }
    }

    pub fn get_round(&self, round_id: RoundId) -> Option<RoundInfo> {
        self.state.lock().unwrap()
            .rounds
            .get(&round_id)
            .map(|r| r.round.clone())
    }

    pub fn num_rounds(&self) -> usize {
        self.state.lock().unwrap().rounds.len()
    }

    pub fn last_update_id(&self) -> u64 {
        self.state.lock().unwrap().last_update_id
    }

    pub fn ndf(&self) -> Option<Ndf> {
        self.state.lock().unwrap().ndf.clone()
    }

    /// all zeroes before the first NDF arrived
    pub fn ndf_hash(&self) -> [u8; 32] {
        self.state.lock().unwrap().ndf_hash
    }

    pub fn set_ndf(&self, ndf: Ndf) {
        let mut state = self.state.lock().unwrap();
        state.ndf_hash = ndf.partial_hash();
        state.ndf = Some(ndf);
    }

    /// Merges round updates. An update replaces a cached round only if it is newer, and rounds
    ///  reaching a terminal state notify their watchers.
    pub fn add_rounds(&self, updates: Vec<RoundInfo>) {
        let now = Instant::now();
        let mut any_queued = false;
        {
            let mut state = self.state.lock().unwrap();
            for round in updates {
                if let Some(existing) = state.rounds.get(&round.id) {
                    if existing.round.update_id >= round.update_id {
                        continue;
                    }
                }
                state.last_update_id = state.last_update_id.max(round.update_id);

                if round.state == RoundState::Queued {
                    any_queued = true;
                    state.waiting.insert(round.id, round.clone());
                }
                else {
                    state.waiting.remove(&round.id);
                }
                state.notify_watchers(&round);

                trace!("round {} is {:?}", round.id, round.state);
                state.rounds.insert(round.id, CachedRound { round, added: now });
            }
        }
        if any_queued {
            self.round_queued.notify_waiters();
        }
    }

    fn best_waiting(&self, excluded: &FxHashSet<RoundId>) -> Option<RoundInfo> {
        let now = SystemTime::now();
        let mut state = self.state.lock().unwrap();

        let started = state.waiting.values()
            .filter(|r| r.time_until_realtime(now).is_zero())
            .map(|r| r.id)
            .collect::<Vec<_>>();
        for rid in started {
            state.waiting.remove(&rid);
        }

        state.waiting.values()
            .filter(|r| !excluded.contains(&r.id))
            .min_by_key(|r| r.scheduled_realtime_start())
            .cloned()
    }

    /// The queued round with the earliest realtime start that is not in `excluded`, waiting up
    ///  to `timeout` for one to show up.
    pub async fn upcoming(&self, excluded: &FxHashSet<RoundId>, timeout: Duration) -> Option<RoundInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.round_queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(round) = self.best_waiting(excluded) {
                return Some(round);
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Registers for the outcome of a round. The receiver resolves immediately if the round is
    ///  known to be finished already.
    pub fn watch_round(&self, round_id: RoundId) -> oneshot::Receiver<RoundOutcome> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state.lock().unwrap();

        match state.rounds.get(&round_id).map(|r| r.round.state) {
            Some(RoundState::Completed) => { let _ = sender.send(RoundOutcome::Completed); }
            Some(RoundState::Failed) => { let _ = sender.send(RoundOutcome::Failed); }
            _ => {
                let watchers = state.watchers.entry(round_id).or_default();
                watchers.retain(|w| !w.is_closed());
                watchers.push(sender);
            }
        }
        receiver
    }

    /// Drops rounds that were cached longer than the retention period ago, along with watchers
    ///  that gave up waiting.
    pub fn evict(&self) -> usize {
        let cutoff = match Instant::now().checked_sub(self.retention) {
            Some(c) => c,
            None => return 0,
        };

        let mut state = self.state.lock().unwrap();
        let expired = state.rounds.iter()
            .filter(|(_, r)| r.added < cutoff)
            .map(|(&rid, _)| rid)
            .collect::<Vec<_>>();
        for rid in &expired {
            state.rounds.remove(rid);
            state.waiting.remove(rid);
        }
        state.watchers.retain(|_, w| {
            w.retain(|s| !s.is_closed());
            !w.is_empty()
        });

        if !expired.is_empty() {
            debug!("evicted {} rounds from the round cache", expired.len());
        }
        expired.len()
    }
}

#[async_trait]
impl RoundWatcher for RoundCache {
    async fn wait_for_round(&self, round_id: RoundId, timeout: Duration) -> RoundOutcome {
        let receiver = self.watch_round(round_id);
        match time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => RoundOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use crate::test_util::round::{test_queued_round, test_round};
    use super::*;

    #[test]
    fn test_add_rounds_keeps_newest_update() {
        let cache = RoundCache::new(Duration::from_secs(60));
        let mut round = test_round(5, RoundState::Completed, 3);
        round.update_id = 10;
        cache.add_rounds(vec![round.clone()]);

        let mut older = test_round(5, RoundState::Queued, 3);
        older.update_id = 9;
        cache.add_rounds(vec![older]);

        assert_eq!(cache.get_round(5), Some(round));
        assert_eq!(cache.last_update_id(), 10);
    }

    #[tokio::test]
    async fn test_upcoming_respects_exclusion() {
        let cache = RoundCache::new(Duration::from_secs(60));
        cache.add_rounds(vec![
            test_queued_round(1, 3, Duration::from_secs(5)),
            test_queued_round(2, 3, Duration::from_secs(10)),
        ]);

        let mut excluded = FxHashSet::default();
        let first = cache.upcoming(&excluded, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.id, 1);

        excluded.insert(1);
        let second = cache.upcoming(&excluded, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.id, 2);

        excluded.insert(2);
        assert!(cache.upcoming(&excluded, Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_upcoming_skips_started_rounds() {
        let cache = RoundCache::new(Duration::from_secs(60));
        let mut started = test_queued_round(1, 3, Duration::ZERO);
        started.timestamps[RoundState::Queued as usize] = 1;
        cache.add_rounds(vec![started]);

        assert!(cache.upcoming(&FxHashSet::default(), Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_upcoming_waits_for_queued_round() {
        let cache = Arc::new(RoundCache::new(Duration::from_secs(60)));
        let cache2 = cache.clone();
        let handle = tokio::spawn(async move {
            cache2.upcoming(&FxHashSet::default(), Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.add_rounds(vec![test_queued_round(7, 3, Duration::from_secs(30))]);

        assert_eq!(handle.await.unwrap().map(|r| r.id), Some(7));
    }

    #[tokio::test]
    async fn test_wait_for_round() {
        let cache = Arc::new(RoundCache::new(Duration::from_secs(60)));
        let cache2 = cache.clone();
        let handle = tokio::spawn(async move {
            cache2.wait_for_round(3, Duration::from_secs(5)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.add_rounds(vec![test_round(3, RoundState::Failed, 3)]);

        assert_eq!(handle.await.unwrap(), RoundOutcome::Failed);
        assert_eq!(cache.wait_for_round(3, Duration::from_secs(5)).await, RoundOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_round_timeout() {
        let cache = RoundCache::new(Duration::from_secs(60));
        cache.add_rounds(vec![test_round(3, RoundState::Realtime, 3)]);
        assert_eq!(cache.wait_for_round(3, Duration::from_secs(1)).await, RoundOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict() {
        let cache = RoundCache::new(Duration::from_secs(60));
        cache.add_rounds(vec![test_round(1, RoundState::Completed, 3)]);
        time::advance(Duration::from_secs(30)).await;
        cache.add_rounds(vec![test_round(2, RoundState::Completed, 3)]);
        time::advance(Duration::from_secs(31)).await;

        assert_eq!(cache.evict(), 1);
        assert!(cache.get_round(1).is_none());
        assert!(cache.get_round(2).is_some());
    }
}
