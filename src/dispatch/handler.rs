use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::dispatch::fingerprints::FingerprintsMap;
use crate::dispatch::services::ServicesMap;
use crate::identity::identity_tracker::ReceptionIdentity;
use crate::primitives::message::CmixMessage;
use crate::primitives::round::RoundInfo;
use crate::util::stoppable::StopSignal;

/// the messages picked up from one round for one identity
#[derive(Debug, Clone)]
pub struct Bundle {
    pub round: RoundInfo,
    pub identity: ReceptionIdentity,
    pub messages: Vec<CmixMessage>,
}

struct UnmatchedMessage {
    message: CmixMessage,
    identity: ReceptionIdentity,
    round: RoundInfo,
    tries: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct UnmatchedParams {
    /// number of retained messages, the oldest being dropped first
    pub max_messages: usize,
    /// a retained message is dropped after this many unsuccessful matching attempts
    pub max_tries: u32,
}

impl Default for UnmatchedParams {
    fn default() -> Self {
        UnmatchedParams {
            max_messages: 1000,
            max_tries: 5,
        }
    }
}

/// Matches received messages against fingerprints first and services second. Messages matching
///  neither are retained for a while: their fingerprint or service may be registered shortly
///  after the message arrives.
pub struct Handler {
    fingerprints: FingerprintsMap,
    services: ServicesMap,
    unmatched: Mutex<VecDeque<UnmatchedMessage>>,
    params: UnmatchedParams,
}

impl Handler {
    pub fn new(params: UnmatchedParams) -> Handler {
        Handler {
            fingerprints: FingerprintsMap::new(),
            services: ServicesMap::new(),
            unmatched: Default::default(),
            params,
        }
    }

    pub fn fingerprints(&self) -> &FingerprintsMap {
        &self.fingerprints
    }

    pub fn services(&self) -> &ServicesMap {
        &self.services
    }

    pub fn num_unmatched(&self) -> usize {
        self.unmatched.lock().unwrap().len()
    }

    /// Passes a message to the processor(s) it matches. Returns false if it matched nothing.
    pub fn handle_message(&self, message: &CmixMessage, identity: &ReceptionIdentity, round: &RoundInfo) -> bool {
        let client_id = identity.source;

        if let Some(processor) = self.fingerprints.pop(&client_id, &message.key_fp) {
            trace!("message in round {} matched fingerprint {:?}", round.id, message.key_fp);
            processor.process(message, identity, round);
            return true;
        }

        let processors = self.services.get(&client_id, &message.sih, &message.contents);
        if processors.is_empty() {
            return false;
        }
        trace!("message in round {} matched {} service processors", round.id, processors.len());
        for processor in processors {
            processor.process(message, identity, round);
        }
        true
    }

    pub fn handle_bundle(&self, bundle: Bundle) {
        let Bundle { round, identity, messages } = bundle;
        debug!("handling {} messages from round {} for {:?}", messages.len(), round.id, identity.source);

        for message in messages {
            if !self.handle_message(&message, &identity, &round) {
                trace!("message in round {} matched nothing, retaining it", round.id);
                self.retain(UnmatchedMessage {
                    message,
                    identity: identity.clone(),
                    round: round.clone(),
                    tries: 0,
                });
            }
        }
    }

    fn retain(&self, message: UnmatchedMessage) {
        let mut unmatched = self.unmatched.lock().unwrap();
        if unmatched.len() >= self.params.max_messages {
            unmatched.pop_front();
        }
        unmatched.push_back(message);
    }

    /// Tries retained messages again, typically after adding a fingerprint or service
    pub fn check_unmatched_messages(&self) {
        let retained = std::mem::take(&mut *self.unmatched.lock().unwrap());
        if retained.is_empty() {
            return;
        }

        let mut num_matched = 0;
        let mut num_dropped = 0;
        for mut entry in retained {
            if self.handle_message(&entry.message, &entry.identity, &entry.round) {
                num_matched += 1;
                continue;
            }
            entry.tries += 1;
            if entry.tries >= self.params.max_tries {
                num_dropped += 1;
                continue;
            }
            self.retain(entry);
        }
        debug!("checked unmatched messages: {} matched, {} dropped", num_matched, num_dropped);
    }

    /// One dispatch worker. Several of them share the receiver.
    pub async fn run_worker(self: Arc<Self>, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Bundle>>>, stop: StopSignal) {
        loop {
            let bundle = {
                let mut receiver = receiver.lock().await;
                select! {
                    bundle = receiver.recv() => bundle,
                    _ = stop.stopped() => None,
                }
            };
            match bundle {
                Some(bundle) => self.handle_bundle(bundle),
                None => break,
            }
        }
        debug!("dispatch worker stopped");
    }
}
