use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::dispatch::handler::Bundle;
use crate::follow::processing::ProcessingRounds;
use crate::follow::unchecked::UncheckedRounds;
use crate::gateway::comms::{GatewayComms, MessageRequest};
use crate::gateway::sender::Sender;
use crate::identity::identity_tracker::{IdentityTracker, ReceptionIdentity};
use crate::primitives::message::CmixMessage;
use crate::primitives::round::RoundInfo;
use crate::util::stoppable::StopSignal;

/// a resolved round to pick up messages from, for one identity
#[derive(Debug, Clone)]
pub struct RoundLookup {
    pub round: RoundInfo,
    pub identity: ReceptionIdentity,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetrievalOutcome {
    /// messages were handed to dispatch
    Delivered(usize),
    /// bloom filter false positive
    Empty,
    /// the round was resolved for the identity in the meantime, or the identity is gone
    AlreadyChecked,
    /// the gateway does not have the round although it was assigned to it; the round is dropped
    MissingRound,
    /// the request failed and the round is retried later
    Failed,
}

/// Picks up messages for resolved rounds from the last gateway of each round's topology and
///  hands them to dispatch.
pub struct MessageRetrieval {
    sender: Arc<Sender>,
    comms: Arc<dyn GatewayComms>,
    processing: Arc<ProcessingRounds>,
    identities: Arc<IdentityTracker>,
    unchecked: Arc<UncheckedRounds>,
    dispatch: mpsc::Sender<Bundle>,
    timeout: Duration,
}

impl MessageRetrieval {
    pub fn new(
        sender: Arc<Sender>,
        comms: Arc<dyn GatewayComms>,
        processing: Arc<ProcessingRounds>,
        identities: Arc<IdentityTracker>,
        unchecked: Arc<UncheckedRounds>,
        dispatch: mpsc::Sender<Bundle>,
        timeout: Duration,
    ) -> MessageRetrieval {
        MessageRetrieval {
            sender,
            comms,
            processing,
            identities,
            unchecked,
            dispatch,
            timeout,
        }
    }

    fn resolve(&self, lookup: &RoundLookup) {
        self.identities.check(&lookup.identity.source, lookup.round.id);
        self.processing.done(lookup.round.id, &lookup.identity);
        self.unchecked.remove(lookup.round.id, &lookup.identity);
    }

    #[instrument(level = "trace", skip_all, fields(round_id = lookup.round.id))]
    pub async fn retrieve(&self, lookup: RoundLookup) -> RetrievalOutcome {
        let round_id = lookup.round.id;
        let identity = &lookup.identity;

        if self.identities.is_checked(&identity.source, round_id) {
            trace!("round {} is checked for {:?} already, skipping", round_id, identity.source);
            self.processing.done(round_id, identity);
            self.unchecked.remove(round_id, identity);
            return RetrievalOutcome::AlreadyChecked;
        }

        let last_gateway = match lookup.round.last_gateway() {
            Ok(gw) => gw,
            Err(e) => {
                warn!("cannot pick up messages, dropping round {}: {}", round_id, e);
                self.resolve(&lookup);
                return RetrievalOutcome::MissingRound;
            }
        };

        let comms = &self.comms;
        let client_id = identity.ephemeral_id();
        let response = self.sender.send_to_preferred(&[last_gateway], |host, target, _remaining| async move {
            let request = MessageRequest {
                client_id,
                round_id,
                target,
            };
            comms.request_messages(&host, &request).await
        }, self.timeout).await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("failed to pick up messages for round {} from {:?}: {:#}", round_id, last_gateway, e);
                self.processing.fail(round_id, identity);
                return RetrievalOutcome::Failed;
            }
        };

        if !response.has_round {
            warn!("gateway {:?} does not have round {} although it was in the round's topology, dropping it", last_gateway, round_id);
            self.resolve(&lookup);
            return RetrievalOutcome::MissingRound;
        }

        if response.messages.is_empty() {
            debug!("no messages in round {} for {:?}: bloom filter false positive", round_id, identity.source);
            self.resolve(&lookup);
            return RetrievalOutcome::Empty;
        }

        let mut messages = Vec::with_capacity(response.messages.len());
        for raw in &response.messages {
            match CmixMessage::from_bytes(raw) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("dropping undecodable message from round {}: {}", round_id, e),
            }
        }
        let num_messages = messages.len();
        trace!("picked up {} messages from round {}", num_messages, round_id);

        let bundle = Bundle {
            round: lookup.round.clone(),
            identity: identity.clone(),
            messages,
        };
        if self.dispatch.send(bundle).await.is_err() {
            warn!("dispatch is not running, round {} is retried later", round_id);
            self.processing.fail(round_id, identity);
            return RetrievalOutcome::Failed;
        }

        self.resolve(&lookup);
        RetrievalOutcome::Delivered(num_messages)
    }

    /// One retrieval worker. Several of them share the receiver.
    pub async fn run_worker(self: Arc<Self>, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<RoundLookup>>>, stop: StopSignal) {
        loop {
            let lookup = {
                let mut receiver = receiver.lock().await;
                select! {
                    lookup = receiver.recv() => lookup,
                    _ = stop.stopped() => None,
                }
            };
            match lookup {
                Some(lookup) => { self.retrieve(lookup).await; }
                None => break,
            }
        }
        debug!("message retrieval worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use crate::follow::processing::ProcessDecision;
    use crate::follow::unchecked::UncheckedRoundsParams;
    use crate::gateway::comms::MessageResponse;
    use crate::gateway::host_pool::{HostPool, HostPoolParams};
    use crate::primitives::ephemeral::EphemeralId;
    use crate::primitives::fingerprint::{Fingerprint, IDENTITY_FP_LEN};
    use crate::primitives::message::MAC_LEN;
    use crate::primitives::round::RoundState;
    use crate::storage::kv::MemStore;
    use crate::test_util::comms::TrackingMockComms;
    use crate::test_util::identity::test_identity;
    use crate::test_util::ndf::{test_gateway_id, test_ndf};
    use crate::test_util::round::test_round;
    use crate::util::stoppable::Stoppable;
    use super::*;

    struct Fixture {
        comms: Arc<TrackingMockComms>,
        processing: Arc<ProcessingRounds>,
        identities: Arc<IdentityTracker>,
        unchecked: Arc<UncheckedRounds>,
        retrieval: Arc<MessageRetrieval>,
        dispatch: mpsc::Receiver<Bundle>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let pool = HostPool::new(HostPoolParams::default(), test_ndf(&[1, 2, 3, 4]), store.clone()).unwrap();
        let sender = Arc::new(Sender::new(Arc::new(pool)));
        let comms = Arc::new(TrackingMockComms::new());
        let processing = Arc::new(ProcessingRounds::new());
        let identities = Arc::new(IdentityTracker::new(store.clone()));
        let unchecked = Arc::new(UncheckedRounds::new(UncheckedRoundsParams::default(), store));
        let (dispatch_sender, dispatch) = mpsc::channel(10);

        let retrieval = Arc::new(MessageRetrieval::new(
            sender,
            comms.clone(),
            processing.clone(),
            identities.clone(),
            unchecked.clone(),
            dispatch_sender,
            Duration::from_secs(3),
        ));
        Fixture { comms, processing, identities, unchecked, retrieval, dispatch }
    }

    fn lookup(round_id: u64) -> RoundLookup {
        RoundLookup {
            round: test_round(round_id, RoundState::Completed, 3),
            identity: test_identity(1),
        }
    }

    fn raw_message(seed: &[u8]) -> Vec<u8> {
        CmixMessage {
            key_fp: Fingerprint::from_seed(seed),
            mac: [0u8; MAC_LEN],
            ephemeral_rid: EphemeralId::default(),
            sih: [0u8; IDENTITY_FP_LEN],
            contents: seed.to_vec(),
        }.to_bytes()
    }

    fn start_processing(f: &Fixture, lookup: &RoundLookup) {
        let identity = &lookup.identity;
        f.identities.add_identity(identity.source, identity.address_space_size, 0);
        assert_eq!(f.processing.process(lookup.round.id, identity), ProcessDecision::Process(0));
        f.unchecked.add(lookup.round.id, Some(lookup.round.clone()), identity);
    }

    #[tokio::test]
    async fn test_messages_are_dispatched() {
        let mut f = fixture();
        let lookup = lookup(7);
        start_processing(&f, &lookup);
        f.comms.set_messages(7, Ok(MessageResponse {
            has_round: true,
            messages: vec![raw_message(b"a"), raw_message(b"b"), vec![1, 2]],
        }));

        assert_eq!(f.retrieval.retrieve(lookup.clone()).await, RetrievalOutcome::Delivered(2));

        let bundle = f.dispatch.recv().await.unwrap();
        assert_eq!(bundle.round.id, 7);
        assert_eq!(bundle.messages.len(), 2);

        assert!(f.identities.is_checked(&lookup.identity.source, 7));
        assert!(!f.processing.is_processing(7, &lookup.identity));
        assert!(f.unchecked.is_empty());

        let requests = f.comms.message_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, test_gateway_id(3));
        assert_eq!(requests[0].1.target, test_gateway_id(3));
        assert_eq!(requests[0].1.client_id, lookup.identity.ephemeral_id());
    }

    #[tokio::test]
    async fn test_false_positive_is_done_not_failed() {
        let mut f = fixture();
        let lookup = lookup(7);
        start_processing(&f, &lookup);
        f.comms.set_messages(7, Ok(MessageResponse { has_round: true, messages: Vec::new() }));

        assert_eq!(f.retrieval.retrieve(lookup.clone()).await, RetrievalOutcome::Empty);

        assert!(f.dispatch.try_recv().is_err());
        assert_eq!(f.processing.len(), 0);
        assert!(f.identities.is_checked(&lookup.identity.source, 7));
        assert!(f.unchecked.is_empty());
    }

    #[tokio::test]
    async fn test_missing_round_is_dropped() {
        let mut f = fixture();
        let lookup = lookup(7);
        start_processing(&f, &lookup);

        assert_eq!(f.retrieval.retrieve(lookup.clone()).await, RetrievalOutcome::MissingRound);

        assert!(f.dispatch.try_recv().is_err());
        assert_eq!(f.processing.len(), 0);
        assert!(f.identities.is_checked(&lookup.identity.source, 7));
        assert!(f.unchecked.is_empty());
    }

    #[tokio::test]
    async fn test_round_without_topology_is_dropped() {
        let f = fixture();
        let mut lookup = lookup(7);
        lookup.round.topology.clear();
        start_processing(&f, &lookup);

        assert_eq!(f.retrieval.retrieve(lookup.clone()).await, RetrievalOutcome::MissingRound);

        assert!(f.comms.message_requests().is_empty());
        assert_eq!(f.processing.len(), 0);
        assert!(f.identities.is_checked(&lookup.identity.source, 7));
        assert!(f.unchecked.is_empty());
    }

    #[tokio::test]
    async fn test_checked_round_is_not_picked_up_again() {
        let mut f = fixture();
        let lookup = lookup(7);
        start_processing(&f, &lookup);
        f.comms.set_messages(7, Ok(MessageResponse { has_round: true, messages: vec![raw_message(b"a")] }));

        assert_eq!(f.retrieval.retrieve(lookup.clone()).await, RetrievalOutcome::Delivered(1));
        assert_eq!(f.retrieval.retrieve(lookup.clone()).await, RetrievalOutcome::AlreadyChecked);

        assert_eq!(f.dispatch.recv().await.unwrap().round.id, 7);
        assert!(f.dispatch.try_recv().is_err());
        assert_eq!(f.comms.message_requests().len(), 1);
        assert_eq!(f.processing.len(), 0);
    }

    #[tokio::test]
    async fn test_comms_error_fails_round() {
        let f = fixture();
        let lookup = lookup(7);
        start_processing(&f, &lookup);
        f.comms.set_messages(7, Err("round is not ready yet".to_string()));

        assert_eq!(f.retrieval.retrieve(lookup.clone()).await, RetrievalOutcome::Failed);

        assert!(!f.processing.is_processing(7, &lookup.identity));
        assert_eq!(f.processing.process(7, &lookup.identity), ProcessDecision::Process(1));
        assert!(!f.identities.is_checked(&lookup.identity.source, 7));
        assert_eq!(f.unchecked.len(), 1);
    }

    #[tokio::test]
    async fn test_workers() {
        let mut f = fixture();
        let identity = test_identity(1);
        f.identities.add_identity(identity.source, identity.address_space_size, 0);
        f.comms.set_messages(7, Ok(MessageResponse { has_round: true, messages: vec![raw_message(b"a")] }));
        f.comms.set_messages(8, Ok(MessageResponse { has_round: true, messages: vec![raw_message(b"b")] }));

        let (sender, receiver) = mpsc::channel(10);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let mut stoppable = Stoppable::new("retrieval");
        for i in 0..2 {
            stoppable.spawn(format!("worker-{}", i), f.retrieval.clone().run_worker(receiver.clone(), stoppable.signal()));
        }

        sender.send(lookup(7)).await.unwrap();
        sender.send(lookup(8)).await.unwrap();

        let mut rounds = vec![f.dispatch.recv().await.unwrap().round.id, f.dispatch.recv().await.unwrap().round.id];
        rounds.sort();
        assert_eq!(rounds, vec![7, 8]);

        stoppable.stop(Duration::from_secs(1)).await.unwrap();
    }
}
