use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::gateway::comms::{ClientKeyRequest, ClientKeyResponse, GatewayComms, GatewaySlot, GatewaySlots, MessageRequest, MessageResponse, PollRequest, PollResponse, PutMessageResponse};
use crate::gateway::host::Host;
use crate::primitives::id::Id;
use crate::primitives::known_rounds::KnownRounds;
use crate::primitives::round::{RoundId, RoundInfo};

/// a call received by [TrackingMockComms], together with the host it was sent to
#[derive(Debug, Clone)]
pub enum CommsCall {
    Poll(Id, PollRequest),
    PutMessage(Id, GatewaySlot),
    PutManyMessages(Id, GatewaySlots),
    HistoricalRounds(Id, Vec<RoundId>),
    RequestMessages(Id, MessageRequest),
    RequestClientKey(Id, ClientKeyRequest),
}

/// A scripted gateway transport that records every call. Responses are configured per call type;
///  scripted errors are given as text because that is how the engine classifies them.
#[derive(Default)]
pub struct TrackingMockComms {
    calls: Mutex<Vec<CommsCall>>,
    poll_responses: Mutex<VecDeque<Result<PollResponse, String>>>,
    put_responses: Mutex<VecDeque<Result<PutMessageResponse, String>>>,
    historical_rounds: Mutex<FxHashMap<RoundId, RoundInfo>>,
    historical_error: Mutex<Option<String>>,
    messages: Mutex<FxHashMap<RoundId, Result<MessageResponse, String>>>,
    client_key_error: Mutex<Option<String>>,
}

impl TrackingMockComms {
    pub fn new() -> TrackingMockComms {
        Default::default()
    }

    pub fn push_poll_response(&self, response: Result<PollResponse, String>) {
        self.poll_responses.lock().unwrap().push_back(response);
    }

    /// scripted results for `put_message` and `put_many_messages`; once they are used up, every
    ///  message is accepted
    pub fn push_put_response(&self, response: Result<PutMessageResponse, String>) {
        self.put_responses.lock().unwrap().push_back(response);
    }

    pub fn add_historical_round(&self, round: RoundInfo) {
        self.historical_rounds.lock().unwrap().insert(round.id, round);
    }

    pub fn set_historical_error(&self, error: Option<&str>) {
        *self.historical_error.lock().unwrap() = error.map(|e| e.to_string());
    }

    pub fn set_messages(&self, round_id: RoundId, response: Result<MessageResponse, String>) {
        self.messages.lock().unwrap().insert(round_id, response);
    }

    pub fn set_client_key_error(&self, error: Option<&str>) {
        *self.client_key_error.lock().unwrap() = error.map(|e| e.to_string());
    }

    pub fn calls(&self) -> Vec<CommsCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn num_put_calls(&self) -> usize {
        self.calls.lock().unwrap().iter()
            .filter(|c| matches!(c, CommsCall::PutMessage(..) | CommsCall::PutManyMessages(..)))
            .count()
    }

    pub fn put_slots(&self) -> Vec<GatewaySlot> {
        self.calls.lock().unwrap().iter()
            .filter_map(|c| match c {
                CommsCall::PutMessage(_, slot) => Some(slot.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn historical_requests(&self) -> Vec<Vec<RoundId>> {
        self.calls.lock().unwrap().iter()
            .filter_map(|c| match c {
                CommsCall::HistoricalRounds(_, rids) => Some(rids.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn message_requests(&self) -> Vec<(Id, MessageRequest)> {
        self.calls.lock().unwrap().iter()
            .filter_map(|c| match c {
                CommsCall::RequestMessages(host, request) => Some((*host, request.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn client_key_requests(&self) -> Vec<ClientKeyRequest> {
        self.calls.lock().unwrap().iter()
            .filter_map(|c| match c {
                CommsCall::RequestClientKey(_, request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: CommsCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_put_response(&self) -> anyhow::Result<PutMessageResponse> {
        match self.put_responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok(PutMessageResponse { accepted: true }),
        }
    }
}

#[async_trait]
impl GatewayComms for TrackingMockComms {
    async fn poll(&self, host: &Host, request: &PollRequest) -> anyhow::Result<PollResponse> {
        self.record(CommsCall::Poll(host.id(), request.clone()));
        match self.poll_responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok(PollResponse {
                partial_ndf: None,
                round_updates: Vec::new(),
                known_rounds: KnownRounds::new(request.last_round),
                last_tracked_round: request.last_round,
                filters: Vec::new(),
            }),
        }
    }

    async fn put_message(&self, host: &Host, slot: &GatewaySlot, _timeout: Duration) -> anyhow::Result<PutMessageResponse> {
        self.record(CommsCall::PutMessage(host.id(), slot.clone()));
        self.next_put_response()
    }

    async fn put_many_messages(&self, host: &Host, slots: &GatewaySlots, _timeout: Duration) -> anyhow::Result<PutMessageResponse> {
        self.record(CommsCall::PutManyMessages(host.id(), slots.clone()));
        self.next_put_response()
    }

    async fn request_historical_rounds(&self, host: &Host, round_ids: &[RoundId], _timeout: Duration) -> anyhow::Result<Vec<Option<RoundInfo>>> {
        self.record(CommsCall::HistoricalRounds(host.id(), round_ids.to_vec()));
        if let Some(e) = self.historical_error.lock().unwrap().as_ref() {
            return Err(anyhow!(e.clone()));
        }
        let known = self.historical_rounds.lock().unwrap();
        Ok(round_ids.iter()
            .map(|rid| known.get(rid).cloned())
            .collect())
    }

    async fn request_messages(&self, host: &Host, request: &MessageRequest) -> anyhow::Result<MessageResponse> {
        self.record(CommsCall::RequestMessages(host.id(), request.clone()));
        match self.messages.lock().unwrap().get(&request.round_id) {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(e)) => Err(anyhow!(e.clone())),
            None => Ok(MessageResponse::default()),
        }
    }

    async fn request_client_key(&self, host: &Host, request: &ClientKeyRequest) -> anyhow::Result<ClientKeyResponse> {
        self.record(CommsCall::RequestClientKey(host.id(), request.clone()));
        if let Some(e) = self.client_key_error.lock().unwrap().as_ref() {
            return Err(anyhow!(e.clone()));
        }
        Ok(ClientKeyResponse {
            node_key_material: request.node_id.as_bytes().to_vec(),
            key_id: request.node_id.data()[..8].to_vec(),
            valid_until: u64::MAX,
        })
    }
}
