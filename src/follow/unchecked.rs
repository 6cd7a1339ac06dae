use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::follow::historical::HistoricalRounds;
use crate::follow::processing::{round_identity_key, ProcessDecision, ProcessingRounds, RoundIdentityKey};
use crate::follow::retrieval::RoundLookup;
use crate::identity::identity_tracker::{IdentityTracker, ReceptionIdentity};
use crate::primitives::round::{to_nanos, RoundId, RoundInfo};
use crate::rounds::round_cache::RoundCache;
use crate::storage::kv::{KvStore, VersionedObject};
use crate::util::backoff::Backoff;
use crate::util::buf::{put_bool, try_get_bool};
use crate::util::stoppable::StopSignal;

pub const UNCHECKED_ROUNDS_KEY: &str = "follow/uncheckedRounds";
const UNCHECKED_ROUNDS_VERSION: u64 = 0;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UncheckedRound {
    pub round_id: RoundId,
    /// round info if it was known when the round was stored
    pub round: Option<RoundInfo>,
    pub identity: ReceptionIdentity,
    pub tries: u64,
    pub last_check: SystemTime,
}

impl UncheckedRound {
    /// the point in time when the round is retried next
    pub fn next_retry(&self, backoff: &Backoff) -> SystemTime {
        self.last_check + backoff.delay(self.tries)
    }

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.round_id);
        match &self.round {
            Some(round) => {
                put_bool(buf, true);
                round.ser(buf);
            }
            None => put_bool(buf, false),
        }
        self.identity.ser(buf);
        buf.put_u64_varint(self.tries);
        buf.put_u64(to_nanos(self.last_check));
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<UncheckedRound> {
        let round_id = buf.try_get_u64()?;
        let round = if try_get_bool(buf)? {
            Some(RoundInfo::try_deser(buf)?)
        }
        else {
            None
        };
        let identity = ReceptionIdentity::try_deser(buf)?;
        let tries = buf.try_get_u64_varint()?;
        let last_check = UNIX_EPOCH + Duration::from_nanos(buf.try_get_u64()?);
        Ok(UncheckedRound { round_id, round, identity, tries, last_check })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UncheckedRoundsParams {
    pub backoff: Backoff,
    /// a round is given up after this many retries
    pub max_tries: u64,
    /// how often the store is scanned for rounds due for a retry
    pub interval: Duration,
}

impl Default for UncheckedRoundsParams {
    fn default() -> Self {
        UncheckedRoundsParams {
            backoff: Backoff::default(),
            max_tries: 10,
            interval: Duration::from_secs(15),
        }
    }
}

/// where the scheduler hands rounds that are due for a retry
pub struct RetryTargets {
    pub rounds: Arc<RoundCache>,
    pub identities: Arc<IdentityTracker>,
    pub processing: Arc<ProcessingRounds>,
    pub historical: Arc<HistoricalRounds>,
    pub retrieval: mpsc::Sender<RoundLookup>,
}

/// Rounds that were handed to message pickup but are not confirmed as picked up yet. They are
///  retried with backoff until pickup succeeds or the retries are used up.
pub struct UncheckedRounds {
    params: UncheckedRoundsParams,
    store: Arc<dyn KvStore>,
    rounds: Mutex<BTreeMap<RoundIdentityKey, UncheckedRound>>,
}

impl UncheckedRounds {
    pub fn new(params: UncheckedRoundsParams, store: Arc<dyn KvStore>) -> UncheckedRounds {
        let rounds = Self::load(store.as_ref());
        if !rounds.is_empty() {
            info!("loaded {} unchecked rounds", rounds.len());
        }
        UncheckedRounds {
            params,
            store,
            rounds: Mutex::new(rounds),
        }
    }

    pub fn params(&self) -> &UncheckedRoundsParams {
        &self.params
    }

    /// Adds a round. If it is present already, only missing round info is filled in.
    pub fn add(&self, round_id: RoundId, round: Option<RoundInfo>, identity: &ReceptionIdentity) {
        {
            let mut rounds = self.rounds.lock().unwrap();
            let entry = rounds.entry(round_identity_key(round_id, identity))
                .or_insert_with(|| UncheckedRound {
                    round_id,
                    round: None,
                    identity: identity.clone(),
                    tries: 0,
                    last_check: SystemTime::now(),
                });
            if entry.round.is_none() {
                entry.round = round;
            }
        }
        self.save();
    }

    pub fn remove(&self, round_id: RoundId, identity: &ReceptionIdentity) -> bool {
        let removed = self.rounds.lock().unwrap()
            .remove(&round_identity_key(round_id, identity))
            .is_some();
        if removed {
            self.save();
        }
        removed
    }

    pub fn get(&self, round_id: RoundId, identity: &ReceptionIdentity) -> Option<UncheckedRound> {
        self.rounds.lock().unwrap()
            .get(&round_identity_key(round_id, identity))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rounds.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rounds due for a retry at `now`. Their try counter is incremented and persisted right away,
    ///  whatever the outcome of the retry, and rounds that used up their retries are dropped.
    pub fn take_due(&self, now: SystemTime) -> Vec<UncheckedRound> {
        let mut due = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut rounds = self.rounds.lock().unwrap();
            for (key, entry) in rounds.iter_mut() {
                if now <= entry.next_retry(&self.params.backoff) {
                    continue;
                }
                if entry.tries >= self.params.max_tries {
                    exhausted.push(*key);
                    continue;
                }
                due.push(entry.clone());
                entry.tries += 1;
                entry.last_check = now;
            }
            for key in &exhausted {
                if let Some(entry) = rounds.remove(key) {
                    warn!("giving up on round {} for {:?} after {} tries", entry.round_id, entry.identity.source, entry.tries);
                }
            }
        }

        if !due.is_empty() || !exhausted.is_empty() {
            self.save();
        }
        due
    }

    /// Hands rounds due for a retry to retrieval, or to historical lookup if their round info is
    ///  unknown. Rounds resolved in the meantime are dropped, rounds still in flight are skipped.
    ///  Returns the number of rounds handed on.
    #[instrument(level = "trace", skip_all)]
    pub fn retry_due(&self, now: SystemTime, targets: &RetryTargets) -> usize {
        let due = self.take_due(now);
        if due.is_empty() {
            return 0;
        }
        debug!("retrying {} unchecked rounds", due.len());

        let mut num_routed = 0;
        for entry in due {
            let round_id = entry.round_id;
            let identity = entry.identity;

            if targets.identities.is_checked(&identity.source, round_id) {
                debug!("unchecked round {} was resolved for {:?} in the meantime", round_id, identity.source);
                self.remove(round_id, &identity);
                continue;
            }
            if targets.processing.process(round_id, &identity) == ProcessDecision::InFlight {
                trace!("unchecked round {} is in flight, not retrying it now", round_id);
                continue;
            }

            let round = entry.round
                .or_else(|| targets.rounds.get_round(round_id))
                .filter(|r| r.state.is_terminal());

            let queued = match round {
                Some(round) => match targets.retrieval.try_send(RoundLookup { round, identity: identity.clone() }) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("could not queue unchecked round {} for retrieval: {}", round_id, e);
                        false
                    }
                },
                None => {
                    let queued = targets.historical.request(round_id, Some(identity.clone()));
                    if !queued {
                        debug!("could not queue unchecked round {} for historical lookup", round_id);
                    }
                    queued
                }
            };

            if queued {
                num_routed += 1;
            }
            else {
                targets.processing.release(round_id, &identity);
            }
        }
        num_routed
    }

    pub async fn run_scheduler(self: Arc<Self>, targets: RetryTargets, stop: StopSignal) {
        let mut interval = time::interval(self.params.interval);
        loop {
            select! {
                _ = interval.tick() => { self.retry_due(SystemTime::now(), &targets); }
                _ = stop.stopped() => break,
            }
        }
        debug!("unchecked rounds scheduler stopped");
    }

    fn save(&self) {
        let mut buf = BytesMut::new();
        {
            let rounds = self.rounds.lock().unwrap();
            buf.put_usize_varint(rounds.len());
            for entry in rounds.values() {
                entry.ser(&mut buf);
            }
        }
        if let Err(e) = self.store.set(UNCHECKED_ROUNDS_KEY, VersionedObject::new(UNCHECKED_ROUNDS_VERSION, buf.freeze())) {
            error!("failed to persist unchecked rounds: {}", e);
        }
    }

    fn load(store: &dyn KvStore) -> BTreeMap<RoundIdentityKey, UncheckedRound> {
        let decode = || -> anyhow::Result<BTreeMap<RoundIdentityKey, UncheckedRound>> {
            let obj = match store.get(UNCHECKED_ROUNDS_KEY)? {
                Some(obj) => obj,
                None => return Ok(BTreeMap::new()),
            };
            let mut buf = obj.expect_version(UNCHECKED_ROUNDS_KEY, UNCHECKED_ROUNDS_VERSION)?;
            let len = buf.try_get_usize_varint()?;
            let mut result = BTreeMap::new();
            for _ in 0..len {
                let entry = UncheckedRound::try_deser(&mut buf)?;
                result.insert(round_identity_key(entry.round_id, &entry.identity), entry);
            }
            Ok(result)
        };

        match decode() {
            Ok(rounds) => rounds,
            Err(e) => {
                error!("could not load unchecked rounds: {}", e);
                BTreeMap::new()
            }
        }
    }
}
