use std::time::Duration;

use async_trait::async_trait;

use crate::gateway::host::Host;
use crate::primitives::bloom::RemoteFilter;
use crate::primitives::ephemeral::{EphemeralId, EphemeralWindow};
use crate::primitives::id::Id;
use crate::primitives::known_rounds::KnownRounds;
use crate::primitives::message::MAC_LEN;
use crate::primitives::ndf::Ndf;
use crate::primitives::round::{RoundId, RoundInfo};

#[derive(Debug, Clone)]
pub struct PollRequest {
    pub client_id: Id,
    pub partial_ndf_hash: [u8; 32],
    pub last_update_id: u64,
    pub last_round: RoundId,
    /// the reception identities whose bloom filters the gateway should return
    pub identities: Vec<EphemeralWindow>,
}

#[derive(Debug, Clone)]
pub struct IdentityFilters {
    pub ephemeral_id: EphemeralId,
    pub filters: Vec<RemoteFilter>,
}

#[derive(Debug, Clone)]
pub struct PollResponse {
    /// only present if the gateway's NDF hash differs from the one in the request
    pub partial_ndf: Option<Ndf>,
    pub round_updates: Vec<RoundInfo>,
    /// rounds the gateway knows to be finished
    pub known_rounds: KnownRounds,
    pub last_tracked_round: RoundId,
    pub filters: Vec<IdentityFilters>,
}

/// one encrypted message with the per-node MACs proving the sender holds each node's key
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SlotMessage {
    pub payload: Vec<u8>,
    /// nodes need the salt to derive the per-message keys
    pub salt: [u8; 32],
    pub kmacs: Vec<[u8; MAC_LEN]>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GatewaySlot {
    pub sender_id: Id,
    pub round_id: RoundId,
    pub message: SlotMessage,
    /// the gateway that should put the message into its batch, which differs from the gateway
    ///  receiving the request when sending through a proxy
    pub target: Id,
    /// authenticates the slot towards the target gateway
    pub mac: [u8; MAC_LEN],
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GatewaySlots {
    pub sender_id: Id,
    pub round_id: RoundId,
    pub messages: Vec<SlotMessage>,
    pub target: Id,
    pub mac: [u8; MAC_LEN],
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PutMessageResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageRequest {
    pub client_id: EphemeralId,
    pub round_id: RoundId,
    pub target: Id,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MessageResponse {
    pub has_round: bool,
    /// serialized [crate::primitives::message::CmixMessage]s
    pub messages: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientKeyRequest {
    pub client_id: Id,
    pub node_id: Id,
    pub client_public_key: [u8; 32],
    pub timestamp: u64,
    pub target: Id,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientKeyResponse {
    pub node_key_material: Vec<u8>,
    pub key_id: Vec<u8>,
    pub valid_until: u64,
}

/// The RPC surface of gateways as seen by the network engine. Implementations own the actual
///  connections; errors are reported as text and classified by the caller.
#[async_trait]
pub trait GatewayComms: Send + Sync + 'static {
    async fn poll(&self, host: &Host, request: &PollRequest) -> anyhow::Result<PollResponse>;

    async fn put_message(&self, host: &Host, slot: &GatewaySlot, timeout: Duration) -> anyhow::Result<PutMessageResponse>;

    async fn put_many_messages(&self, host: &Host, slots: &GatewaySlots, timeout: Duration) -> anyhow::Result<PutMessageResponse>;

    /// one entry per requested round, `None` for rounds the gateway does not know
    async fn request_historical_rounds(&self, host: &Host, round_ids: &[RoundId], timeout: Duration) -> anyhow::Result<Vec<Option<RoundInfo>>>;

    async fn request_messages(&self, host: &Host, request: &MessageRequest) -> anyhow::Result<MessageResponse>;

    async fn request_client_key(&self, host: &Host, request: &ClientKeyRequest) -> anyhow::Result<ClientKeyResponse>;
}
