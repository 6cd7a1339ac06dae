use std::sync::Mutex;

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::identity::identity_tracker::ReceptionIdentity;
use crate::primitives::round::RoundId;

/// identifies a round for one reception identity
pub type RoundIdentityKey = [u8; 32];

pub fn round_identity_key(round_id: RoundId, identity: &ReceptionIdentity) -> RoundIdentityKey {
    Sha256::new()
        .chain_update(round_id.to_be_bytes())
        .chain_update(identity.source.as_bytes())
        .chain_update(identity.ephemeral_id().0)
        .finalize()
        .into()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProcessDecision {
    /// go ahead; this is the n-th attempt (starting at 0)
    Process(u32),
    /// another task is working on the round already
    InFlight,
}

#[derive(Debug, Clone, Copy)]
struct ProcessingStatus {
    attempts: u32,
    in_flight: bool,
}

/// Rounds currently being looked up or retrieved per identity, ensuring a round is never
///  dispatched twice concurrently and counting failed attempts.
#[derive(Default)]
pub struct ProcessingRounds {
    rounds: Mutex<FxHashMap<RoundIdentityKey, ProcessingStatus>>,
}

impl ProcessingRounds {
    pub fn new() -> ProcessingRounds {
        Default::default()
    }

    /// Marks a round as in flight unless it is in flight already
    pub fn process(&self, round_id: RoundId, identity: &ReceptionIdentity) -> ProcessDecision {
        let key = round_identity_key(round_id, identity);
        let mut rounds = self.rounds.lock().unwrap();
        match rounds.get_mut(&key) {
            Some(status) if status.in_flight => ProcessDecision::InFlight,
            Some(status) => {
                status.attempts += 1;
                status.in_flight = true;
                trace!("processing round {} again, attempt {}", round_id, status.attempts);
                ProcessDecision::Process(status.attempts)
            }
            None => {
                rounds.insert(key, ProcessingStatus { attempts: 0, in_flight: true });
                ProcessDecision::Process(0)
            }
        }
    }

    pub fn is_processing(&self, round_id: RoundId, identity: &ReceptionIdentity) -> bool {
        self.rounds.lock().unwrap()
            .get(&round_identity_key(round_id, identity))
            .map(|s| s.in_flight)
            .unwrap_or(false)
    }

    /// the attempt failed; the round can be processed again, counting as another attempt
    pub fn fail(&self, round_id: RoundId, identity: &ReceptionIdentity) {
        if let Some(status) = self.rounds.lock().unwrap().get_mut(&round_identity_key(round_id, identity)) {
            status.in_flight = false;
        }
    }

    /// The round could not be handed on because of local backpressure. It can be processed
    ///  again, and the attempt does not count.
    pub fn release(&self, round_id: RoundId, identity: &ReceptionIdentity) {
        let key = round_identity_key(round_id, identity);
        let mut rounds = self.rounds.lock().unwrap();
        let attempts = match rounds.get(&key) {
            Some(status) if status.in_flight => status.attempts,
            _ => return,
        };
        if attempts == 0 {
            rounds.remove(&key);
        }
        else if let Some(status) = rounds.get_mut(&key) {
            status.attempts -= 1;
            status.in_flight = false;
        }
    }

    /// the round is resolved, or abandoned
    pub fn done(&self, round_id: RoundId, identity: &ReceptionIdentity) {
        self.rounds.lock().unwrap().remove(&round_identity_key(round_id, identity));
    }

    pub fn len(&self) -> usize {
        self.rounds.lock().unwrap().len()
    }
}
