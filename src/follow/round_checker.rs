use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::follow::historical::HistoricalRounds;
use crate::follow::processing::{ProcessDecision, ProcessingRounds};
use crate::follow::retrieval::RoundLookup;
use crate::follow::unchecked::UncheckedRounds;
use crate::identity::identity_tracker::{IdentityTracker, ReceptionIdentity};
use crate::primitives::bloom::RemoteFilter;
use crate::primitives::round::RoundId;
use crate::rounds::round_cache::RoundCache;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CheckOutcome {
    /// the round was checked for the identity before
    AlreadyChecked,
    /// no filter covers the round yet, so it stays unchecked for a later tick
    NotCovered,
    /// no bloom filter covering the round tests positive, so there are no messages
    NoMessages,
    /// the round is being looked up or retrieved already
    InFlight,
    /// round info is cached, the round was queued for message retrieval
    Retrieval,
    /// round info is not cached, the round was queued for a historical lookup
    Historical,
    /// a queue was full; the round is checked again on a later tick without this counting as
    ///  an attempt
    Deferred,
    /// the round exceeded its check attempts and was given up
    Abandoned,
}

/// Decides per round and identity whether messages need to be picked up, and routes the round
///  accordingly.
pub struct RoundChecker {
    identities: Arc<IdentityTracker>,
    processing: Arc<ProcessingRounds>,
    rounds: Arc<RoundCache>,
    unchecked: Arc<UncheckedRounds>,
    historical: Arc<HistoricalRounds>,
    retrieval: mpsc::Sender<RoundLookup>,
    max_attempts: u32,
}

impl RoundChecker {
    pub fn new(
        identities: Arc<IdentityTracker>,
        processing: Arc<ProcessingRounds>,
        rounds: Arc<RoundCache>,
        unchecked: Arc<UncheckedRounds>,
        historical: Arc<HistoricalRounds>,
        retrieval: mpsc::Sender<RoundLookup>,
        max_attempts: u32,
    ) -> RoundChecker {
        RoundChecker {
            identities,
            processing,
            rounds,
            unchecked,
            historical,
            retrieval,
            max_attempts,
        }
    }

    /// `filters` are the bloom filters the gateway returned for the identity's ephemeral ID
    pub fn check(&self, round_id: RoundId, identity: &ReceptionIdentity, filters: &[RemoteFilter]) -> CheckOutcome {
        let source = &identity.source;
        if self.identities.is_checked(source, round_id) {
            return CheckOutcome::AlreadyChecked;
        }

        let mut covering = filters.iter().filter(|f| f.covers(round_id)).peekable();
        if covering.peek().is_none() {
            trace!("no filter covers round {} for {:?} yet", round_id, source);
            return CheckOutcome::NotCovered;
        }
        if !covering.any(|f| f.may_contain(round_id)) {
            trace!("no filter hit for round {} and {:?}", round_id, source);
            self.identities.check(source, round_id);
            return CheckOutcome::NoMessages;
        }

        let attempt = match self.processing.process(round_id, identity) {
            ProcessDecision::InFlight => return CheckOutcome::InFlight,
            ProcessDecision::Process(attempt) => attempt,
        };
        if attempt >= self.max_attempts {
            warn!("abandoning round {} for {:?} after {} attempts", round_id, source, attempt);
            self.identities.check(source, round_id);
            self.processing.done(round_id, identity);
            self.unchecked.remove(round_id, identity);
            return CheckOutcome::Abandoned;
        }

        let round = self.rounds.get_round(round_id)
            .filter(|r| r.state.is_terminal());
        self.unchecked.add(round_id, round.clone(), identity);

        match round {
            Some(round) => {
                debug!("round {} may have messages for {:?}, picking them up", round_id, source);
                match self.retrieval.try_send(RoundLookup { round, identity: identity.clone() }) {
                    Ok(()) => CheckOutcome::Retrieval,
                    Err(e) => {
                        debug!("could not queue round {} for retrieval: {}", round_id, e);
                        self.processing.release(round_id, identity);
                        CheckOutcome::Deferred
                    }
                }
            }
            None => {
                debug!("round {} may have messages for {:?}, looking it up", round_id, source);
                if self.historical.request(round_id, Some(identity.clone())) {
                    CheckOutcome::Historical
                }
                else {
                    self.processing.release(round_id, identity);
                    CheckOutcome::Deferred
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::follow::historical::HistoricalRoundsParams;
    use crate::follow::unchecked::UncheckedRoundsParams;
    use crate::gateway::host_pool::{HostPool, HostPoolParams};
    use crate::gateway::sender::Sender;
    use crate::primitives::bloom::BloomFilter;
    use crate::primitives::round::RoundState;
    use crate::storage::kv::MemStore;
    use crate::test_util::comms::TrackingMockComms;
    use crate::test_util::identity::test_identity;
    use crate::test_util::ndf::test_ndf;
    use crate::test_util::round::test_round;
    use super::*;

    struct Fixture {
        identities: Arc<IdentityTracker>,
        processing: Arc<ProcessingRounds>,
        rounds: Arc<RoundCache>,
        unchecked: Arc<UncheckedRounds>,
        historical_queue: mpsc::Receiver<crate::follow::historical::HistoricalRequest>,
        retrieval_queue: mpsc::Receiver<RoundLookup>,
        checker: RoundChecker,
    }

    fn fixture(retrieval_capacity: usize) -> Fixture {
        let store = Arc::new(MemStore::new());
        let pool = HostPool::new(HostPoolParams::default(), test_ndf(&[1, 2, 3]), store.clone()).unwrap();
        let sender = Arc::new(Sender::new(Arc::new(pool)));
        let identities = Arc::new(IdentityTracker::new(store.clone()));
        let processing = Arc::new(ProcessingRounds::new());
        let rounds = Arc::new(RoundCache::new(Duration::from_secs(600)));
        let unchecked = Arc::new(UncheckedRounds::new(UncheckedRoundsParams::default(), store));
        let (retrieval, retrieval_queue) = mpsc::channel(retrieval_capacity);
        let (historical, historical_queue) = HistoricalRounds::new(
            HistoricalRoundsParams::default(),
            sender,
            Arc::new(TrackingMockComms::new()),
            rounds.clone(),
            processing.clone(),
            retrieval.clone(),
            10,
        );

        let identity = test_identity(1);
        identities.add_identity(identity.source, identity.address_space_size, 0);

        let checker = RoundChecker::new(
            identities.clone(),
            processing.clone(),
            rounds.clone(),
            unchecked.clone(),
            Arc::new(historical),
            retrieval,
            3,
        );
        Fixture { identities, processing, rounds, unchecked, historical_queue, retrieval_queue, checker }
    }

    fn filter_with(first_round: RoundId, range: u32, hits: &[RoundId]) -> RemoteFilter {
        let mut filter = BloomFilter::new(64, 4).unwrap();
        for &rid in hits {
            filter.add(&RemoteFilter::round_element(rid));
        }
        RemoteFilter { first_round, round_range: range, filter }
    }

    #[test]
    fn test_already_checked() {
        let f = fixture(10);
        let identity = test_identity(1);
        f.identities.check(&identity.source, 5);

        assert_eq!(f.checker.check(5, &identity, &[filter_with(0, 100, &[5])]), CheckOutcome::AlreadyChecked);
        assert_eq!(f.processing.len(), 0);
    }

    #[test]
    fn test_no_filter_hit_marks_checked() {
        let f = fixture(10);
        let identity = test_identity(1);

        assert_eq!(f.checker.check(5, &identity, &[filter_with(0, 100, &[])]), CheckOutcome::NoMessages);
        assert!(f.identities.is_checked(&identity.source, 5));

        assert_eq!(f.checker.check(6, &identity, &[filter_with(100, 50, &[6]), filter_with(0, 10, &[])]), CheckOutcome::NoMessages);
        assert!(f.identities.is_checked(&identity.source, 6));
        assert_eq!(f.processing.len(), 0);
    }

    #[test]
    fn test_uncovered_round_stays_unchecked() {
        let f = fixture(10);
        let identity = test_identity(1);

        assert_eq!(f.checker.check(5, &identity, &[]), CheckOutcome::NotCovered);
        assert_eq!(f.checker.check(6, &identity, &[filter_with(100, 50, &[6])]), CheckOutcome::NotCovered);
        assert_eq!(f.checker.check(150, &identity, &[filter_with(100, 50, &[150])]), CheckOutcome::NotCovered);

        assert!(!f.identities.is_checked(&identity.source, 5));
        assert!(!f.identities.is_checked(&identity.source, 6));
        assert!(!f.identities.is_checked(&identity.source, 150));
        assert_eq!(f.processing.len(), 0);
        assert!(f.unchecked.is_empty());
    }

    #[test]
    fn test_cached_round_goes_to_retrieval() {
        let mut f = fixture(10);
        let identity = test_identity(1);
        f.rounds.add_rounds(vec![test_round(5, RoundState::Completed, 3)]);

        assert_eq!(f.checker.check(5, &identity, &[filter_with(0, 100, &[5])]), CheckOutcome::Retrieval);
        assert_eq!(f.retrieval_queue.try_recv().unwrap().round.id, 5);
        assert!(f.processing.is_processing(5, &identity));
        assert!(f.unchecked.get(5, &identity).unwrap().round.is_some());
        assert!(!f.identities.is_checked(&identity.source, 5));

        assert_eq!(f.checker.check(5, &identity, &[filter_with(0, 100, &[5])]), CheckOutcome::InFlight);
        assert!(f.retrieval_queue.try_recv().is_err());
    }

    #[test]
    fn test_unknown_round_goes_to_historical() {
        let mut f = fixture(10);
        let identity = test_identity(1);

        assert_eq!(f.checker.check(5, &identity, &[filter_with(0, 100, &[5])]), CheckOutcome::Historical);
        let request = f.historical_queue.try_recv().unwrap();
        assert_eq!(request.round_id, 5);
        assert_eq!(request.identity, Some(identity.clone()));
        assert!(f.unchecked.get(5, &identity).unwrap().round.is_none());
    }

    #[test]
    fn test_full_retrieval_queue_defers() {
        let f = fixture(1);
        let identity = test_identity(1);
        f.rounds.add_rounds(vec![
            test_round(5, RoundState::Completed, 3),
            test_round(6, RoundState::Completed, 3),
        ]);
        let filters = [filter_with(0, 100, &[5, 6])];

        assert_eq!(f.checker.check(5, &identity, &filters), CheckOutcome::Retrieval);
        assert_eq!(f.checker.check(6, &identity, &filters), CheckOutcome::Deferred);
        assert!(!f.processing.is_processing(6, &identity));
    }

    #[test]
    fn test_deferral_does_not_count_as_attempt() {
        let mut f = fixture(1);
        let identity = test_identity(1);
        f.rounds.add_rounds(vec![
            test_round(5, RoundState::Completed, 3),
            test_round(6, RoundState::Completed, 3),
        ]);
        let filters = [filter_with(0, 100, &[5, 6])];

        assert_eq!(f.checker.check(5, &identity, &filters), CheckOutcome::Retrieval);
        for _ in 0..10 {
            assert_eq!(f.checker.check(6, &identity, &filters), CheckOutcome::Deferred);
        }

        assert_eq!(f.retrieval_queue.try_recv().unwrap().round.id, 5);
        assert_eq!(f.checker.check(6, &identity, &filters), CheckOutcome::Retrieval);
        assert_eq!(f.processing.process(6, &identity), ProcessDecision::InFlight);
        assert!(!f.identities.is_checked(&identity.source, 6));
    }

    #[test]
    fn test_abandoned_after_max_attempts() {
        let f = fixture(10);
        let identity = test_identity(1);
        let filters = [filter_with(0, 100, &[5])];

        for _ in 0..3 {
            assert_eq!(f.checker.check(5, &identity, &filters), CheckOutcome::Historical);
            f.processing.fail(5, &identity);
        }
        assert_eq!(f.checker.check(5, &identity, &filters), CheckOutcome::Abandoned);
        assert!(f.identities.is_checked(&identity.source, 5));
        assert_eq!(f.processing.len(), 0);
        assert!(f.unchecked.is_empty());
    }
}
