use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use rand::RngCore;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::cmix::params::{CmixParams, SendReport, TargetedMessage};
use crate::crypto::{MixCrypto, NodeKey};
use crate::gateway::comms::{GatewayComms, GatewaySlot, GatewaySlots, PutMessageResponse, SlotMessage};
use crate::gateway::sender::Sender;
use crate::health::health_tracker::HealthTracker;
use crate::nodes::registrar::{MixKey, Registrar};
use crate::primitives::ephemeral::EphemeralId;
use crate::primitives::fingerprint::identity_fingerprint;
use crate::primitives::id::Id;
use crate::primitives::message::{set_group_bits, CmixMessage};
use crate::primitives::round::RoundInfo;
use crate::rounds::round_cache::RoundCache;

/// time after the start of realtime during which the gateway may still answer
const SEND_TIMEOUT_SLACK: Duration = Duration::from_millis(250);

/// Sends messages through the mix network, picking rounds until one accepts the message
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoundSenderApi: Send + Sync + 'static {
    async fn send_cmix(&self, message: TargetedMessage, params: CmixParams) -> anyhow::Result<SendReport>;

    /// sends all messages in the same round
    async fn send_many_cmix(&self, messages: Vec<TargetedMessage>, params: CmixParams) -> anyhow::Result<SendReport>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendErrorKind {
    /// the round is full or otherwise unavailable, another round may work
    RoundContention,
    /// the first node does not recognize our key; registering again fixes this
    StaleAuthorization,
    /// the gateway could not be reached; the host pool replaces it
    Transport,
    Unrecoverable,
}

impl SendErrorKind {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SendErrorKind::Unrecoverable)
    }
}

pub fn classify_send_error(error: &str, replacement_errors: &[String]) -> SendErrorKind {
    if error.contains("try a different round") {
        SendErrorKind::RoundContention
    }
    else if error.contains("could not authenticate client") {
        SendErrorKind::StaleAuthorization
    }
    else if replacement_errors.iter().any(|e| error.contains(e.as_str())) {
        SendErrorKind::Transport
    }
    else {
        SendErrorKind::Unrecoverable
    }
}

/// The per-attempt timeout: no longer than the configured maximum, and not much longer than it
///  takes until the round starts, because after that the gateway can no longer add the message.
pub fn send_timeout(round: &RoundInfo, now: SystemTime, max: Duration) -> Duration {
    (round.time_until_realtime(now) + SEND_TIMEOUT_SLACK).min(max)
}

struct PreparedSlots {
    messages: Vec<SlotMessage>,
    ephemeral_ids: Vec<EphemeralId>,
    mac: [u8; 32],
}

pub struct RoundSender {
    client_id: Id,
    sender: Arc<Sender>,
    comms: Arc<dyn GatewayComms>,
    rounds: Arc<RoundCache>,
    registrar: Arc<Registrar>,
    crypto: Arc<dyn MixCrypto>,
    health: Arc<HealthTracker>,
    realtime_buffer: Duration,
}

impl RoundSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: Id,
        sender: Arc<Sender>,
        comms: Arc<dyn GatewayComms>,
        rounds: Arc<RoundCache>,
        registrar: Arc<Registrar>,
        crypto: Arc<dyn MixCrypto>,
        health: Arc<HealthTracker>,
        realtime_buffer: Duration,
    ) -> RoundSender {
        RoundSender {
            client_id,
            sender,
            comms,
            rounds,
            registrar,
            crypto,
            health,
            realtime_buffer,
        }
    }

    /// Builds the encrypted slots for all messages. No await in here, the RNG stays on this thread.
    fn prepare(&self, messages: &[TargetedMessage], round: &RoundInfo, keys: &[MixKey]) -> anyhow::Result<PreparedSlots> {
        let node_keys = keys.iter()
            .map(|k| k.key)
            .collect::<Vec<NodeKey>>();
        let mut rng = rand::rng();

        let mut slot_messages = Vec::with_capacity(messages.len());
        let mut ephemeral_ids = Vec::with_capacity(messages.len());
        for msg in messages {
            let window = EphemeralId::derive(&msg.recipient, round.address_space_size, round.ephemeral_timestamp())?;
            let ephemeral_rid = window.id.fill_random_high_bits(round.address_space_size, &mut rng);

            let cmix_message = CmixMessage {
                key_fp: msg.fingerprint,
                mac: msg.mac,
                ephemeral_rid,
                sih: identity_fingerprint(&msg.contents, msg.service.preimage()),
                contents: msg.contents.clone(),
            };
            let mut raw = cmix_message.to_bytes();
            set_group_bits(&mut raw, &mut rng);

            let mut salt = [0u8; 32];
            rng.fill_bytes(&mut salt);

            slot_messages.push(SlotMessage {
                payload: self.crypto.encrypt(&raw, &node_keys, &salt),
                salt,
                kmacs: self.crypto.kmacs(&raw, &node_keys, &salt),
            });
            ephemeral_ids.push(window.id);
        }

        let first_key = node_keys.first()
            .ok_or_else(|| anyhow!("round {} has no nodes", round.id))?;
        let mut mac_input = Vec::new();
        for m in &slot_messages {
            mac_input.extend_from_slice(&m.payload);
        }
        let mac = self.crypto.gateway_mac(first_key, &mac_input);

        Ok(PreparedSlots {
            messages: slot_messages,
            ephemeral_ids,
            mac,
        })
    }

    async fn put(&self, round: &RoundInfo, slots: PreparedSlots, timeout: Duration) -> anyhow::Result<PutMessageResponse> {
        let first_gateway = round.first_gateway()?;
        let comms = &self.comms;

        if slots.messages.len() == 1 {
            let slot = GatewaySlot {
                sender_id: self.client_id,
                round_id: round.id,
                message: slots.messages[0].clone(),
                target: first_gateway,
                mac: slots.mac,
            };
            self.sender.send_to_preferred(&[first_gateway], |host, target, timeout| {
                let comms = comms.clone();
                let slot = GatewaySlot { target, ..slot.clone() };
                async move { comms.put_message(&host, &slot, timeout).await }
            }, timeout).await
        }
        else {
            let slots = GatewaySlots {
                sender_id: self.client_id,
                round_id: round.id,
                messages: slots.messages,
                target: first_gateway,
                mac: slots.mac,
            };
            self.sender.send_to_preferred(&[first_gateway], |host, target, timeout| {
                let comms = comms.clone();
                let slots = GatewaySlots { target, ..slots.clone() };
                async move { comms.put_many_messages(&host, &slots, timeout).await }
            }, timeout).await
        }
    }

    #[instrument(level = "debug", skip_all, fields(tag = %params.debug_tag))]
    async fn send(&self, messages: &[TargetedMessage], params: &CmixParams) -> anyhow::Result<SendReport> {
        if messages.is_empty() {
            bail!("no messages to send");
        }
        if !self.health.is_healthy() {
            bail!("cannot send {}: the network is not healthy", params.debug_tag);
        }

        let deadline = Instant::now() + params.timeout;
        let mut excluded = FxHashSet::default();

        for attempt in 0..params.round_tries {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let round = match self.rounds.upcoming(&excluded, remaining).await {
                Some(round) => round,
                None => break,
            };
            excluded.insert(round.id);
            trace!("attempt {}: trying round {}", attempt, round.id);

            let now = SystemTime::now();
            if round.realtime_starts_within(now, self.realtime_buffer) {
                debug!("round {} starts realtime too soon, skipping it", round.id);
                continue;
            }

            if let Some(node) = round.topology.iter().find(|n| params.blacklisted_nodes.contains(n)) {
                debug!("round {} contains blacklisted node {:?}, skipping it", round.id, node);
                continue;
            }

            let keys = match self.registrar.get_keys(&round.topology) {
                Ok(keys) => keys,
                Err(missing) => {
                    debug!("no keys for {} nodes in round {}, triggering registration", missing.len(), round.id);
                    for node_id in &missing {
                        self.registrar.trigger_registration(node_id);
                    }
                    continue;
                }
            };

            // failures here depend on the round's parameters, so another round may work
            let slots = match self.prepare(messages, &round, &keys) {
                Ok(slots) => slots,
                Err(e) => {
                    warn!("cannot prepare {} for round {}, trying another round: {:#}", params.debug_tag, round.id, e);
                    continue;
                }
            };
            let ephemeral_ids = slots.ephemeral_ids.clone();
            let timeout = send_timeout(&round, now, params.send_timeout);

            match self.put(&round, slots, timeout).await {
                Ok(response) if response.accepted => {
                    info!("sent {} messages in round {}", messages.len(), round.id);
                    return Ok(SendReport {
                        round_id: round.id,
                        ephemeral_ids,
                    });
                }
                Ok(_) => {
                    debug!("round {} did not accept the message", round.id);
                }
                Err(e) => {
                    let text = format!("{:#}", e);
                    let kind = classify_send_error(&text, &self.sender.pool().params().replacement_errors);
                    match kind {
                        SendErrorKind::StaleAuthorization => {
                            let node_id = round.first_gateway()?.to_node_id();
                            warn!("node {:?} does not recognize our key, registering again", node_id);
                            self.registrar.remove_node(&node_id);
                            self.registrar.trigger_registration(&node_id);
                        }
                        SendErrorKind::Unrecoverable => {
                            return Err(e.context(format!("failed to send {} in round {}", params.debug_tag, round.id)));
                        }
                        _ => debug!("sending in round {} failed ({:?}), trying another round: {}", round.id, kind, text),
                    }
                }
            }
        }

        bail!("failed to send {} after trying {} rounds", params.debug_tag, excluded.len())
    }
}

#[async_trait]
impl RoundSenderApi for RoundSender {
    async fn send_cmix(&self, message: TargetedMessage, params: CmixParams) -> anyhow::Result<SendReport> {
        self.send(std::slice::from_ref(&message), &params).await
    }

    async fn send_many_cmix(&self, messages: Vec<TargetedMessage>, params: CmixParams) -> anyhow::Result<SendReport> {
        self.send(&messages, &params).await
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::crypto::Sha256MixCrypto;
    use crate::gateway::host_pool::{default_replacement_errors, HostPool, HostPoolParams};
    use crate::primitives::fingerprint::Fingerprint;
    use crate::primitives::id::IdType;
    use crate::primitives::service::Service;
    use crate::storage::kv::MemStore;
    use crate::test_util::comms::TrackingMockComms;
    use crate::test_util::ndf::{test_id_from_number, test_ndf, test_node_id};
    use crate::test_util::round::test_queued_round;
    use super::*;

    struct Fixture {
        comms: Arc<TrackingMockComms>,
        rounds: Arc<RoundCache>,
        registrar: Arc<Registrar>,
        health: Arc<HealthTracker>,
        round_sender: RoundSender,
        _registration_queue: tokio::sync::mpsc::Receiver<Id>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let pool = HostPool::new(HostPoolParams::default(), test_ndf(&[1, 2, 3, 4, 5, 6]), store.clone()).unwrap();
        let sender = Arc::new(Sender::new(Arc::new(pool)));
        let comms = Arc::new(TrackingMockComms::new());
        let rounds = Arc::new(RoundCache::new(Duration::from_secs(600)));
        let crypto: Arc<dyn MixCrypto> = Arc::new(Sha256MixCrypto::new([5u8; 32]));
        let (registrar, registration_queue) = Registrar::new(test_id_from_number(100, IdType::User), crypto.clone(), store, 100);
        let registrar = Arc::new(registrar);
        let health = Arc::new(HealthTracker::new(Duration::from_secs(30)));
        health.report(true);

        for n in 1..=6 {
            registrar.add_key(test_node_id(n), MixKey { key: [n as u8; 32], key_id: vec![n as u8], valid_until: u64::MAX });
        }

        let round_sender = RoundSender::new(
            test_id_from_number(100, IdType::User),
            sender,
            comms.clone(),
            rounds.clone(),
            registrar.clone(),
            crypto,
            health.clone(),
            Duration::from_millis(2500),
        );

        Fixture { comms, rounds, registrar, health, round_sender, _registration_queue: registration_queue }
    }

    fn message() -> TargetedMessage {
        TargetedMessage {
            recipient: test_id_from_number(200, IdType::User),
            fingerprint: Fingerprint::from_seed(b"fp"),
            service: Service::new(b"recipient".to_vec(), "default", None),
            contents: b"hello".to_vec(),
            mac: [0u8; 32],
        }
    }

    fn quick_params(round_tries: u32) -> CmixParams {
        CmixParams {
            round_tries,
            timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[rstest]
    #[case::contention("rpc error: try a different round.", SendErrorKind::RoundContention)]
    #[case::auth("could not authenticate client. Is the client registered with this node?", SendErrorKind::StaleAuthorization)]
    #[case::transport("connection refused", SendErrorKind::Transport)]
    #[case::other("invalid slot", SendErrorKind::Unrecoverable)]
    fn test_classify(#[case] error: &str, #[case] expected: SendErrorKind) {
        assert_eq!(classify_send_error(error, &default_replacement_errors()), expected);
    }

    #[test]
    fn test_send_timeout() {
        let now = SystemTime::now();
        let round = test_queued_round(1, 3, Duration::from_secs(10));
        assert_eq!(send_timeout(&round, now, Duration::from_secs(3)), Duration::from_secs(3));

        let mut soon = round.clone();
        soon.timestamps[crate::primitives::round::RoundState::Queued as usize] =
            crate::primitives::round::to_nanos(now + Duration::from_secs(1));
        assert_eq!(send_timeout(&soon, now, Duration::from_secs(3)), Duration::from_millis(1250));
    }

    #[tokio::test]
    async fn test_send_success() {
        let f = fixture();
        f.rounds.add_rounds(vec![test_queued_round(10, 3, Duration::from_secs(20))]);

        let report = f.round_sender.send_cmix(message(), quick_params(3)).await.unwrap();
        assert_eq!(report.round_id, 10);
        assert_eq!(report.ephemeral_ids.len(), 1);

        let slots = f.comms.put_slots();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].round_id, 10);
        assert_eq!(slots[0].target, test_node_id(1).to_gateway_id());
        assert_eq!(slots[0].message.kmacs.len(), 3);
    }

    #[tokio::test]
    async fn test_unhealthy_fails_fast() {
        let f = fixture();
        f.health.report(false);
        f.rounds.add_rounds(vec![test_queued_round(10, 3, Duration::from_secs(20))]);

        assert!(f.round_sender.send_cmix(message(), quick_params(3)).await.is_err());
        assert_eq!(f.comms.num_put_calls(), 0);
    }

    #[tokio::test]
    async fn test_round_starting_too_soon_is_not_used() {
        let f = fixture();
        f.rounds.add_rounds(vec![test_queued_round(10, 3, Duration::from_secs(1))]);

        assert!(f.round_sender.send_cmix(message(), quick_params(1)).await.is_err());
        assert_eq!(f.comms.num_put_calls(), 0);
    }

    #[tokio::test]
    async fn test_round_already_started_is_not_used() {
        let f = fixture();
        let mut round = test_queued_round(10, 3, Duration::ZERO);
        round.timestamps[crate::primitives::round::RoundState::Queued as usize] =
            crate::primitives::round::to_nanos(SystemTime::now() - Duration::from_secs(1));
        f.rounds.add_rounds(vec![round]);

        assert!(f.round_sender.send_cmix(message(), quick_params(1)).await.is_err());
        assert_eq!(f.comms.num_put_calls(), 0);
    }

    #[tokio::test]
    async fn test_contention_tries_another_round() {
        let f = fixture();
        f.rounds.add_rounds(vec![
            test_queued_round(10, 3, Duration::from_secs(20)),
            test_queued_round(11, 3, Duration::from_secs(30)),
        ]);
        f.comms.push_put_response(Err("try a different round.".to_string()));

        let report = f.round_sender.send_cmix(message(), quick_params(5)).await.unwrap();
        assert_eq!(report.round_id, 11);

        let rounds_tried = f.comms.put_slots().iter().map(|s| s.round_id).collect::<Vec<_>>();
        assert_eq!(rounds_tried, vec![10, 11]);
    }

    #[tokio::test]
    async fn test_round_with_invalid_address_space_is_skipped() {
        let f = fixture();
        let mut invalid = test_queued_round(10, 3, Duration::from_secs(20));
        invalid.address_space_size = 70;
        f.rounds.add_rounds(vec![invalid, test_queued_round(11, 3, Duration::from_secs(30))]);

        let report = f.round_sender.send_cmix(message(), quick_params(5)).await.unwrap();
        assert_eq!(report.round_id, 11);

        let rounds_tried = f.comms.put_slots().iter().map(|s| s.round_id).collect::<Vec<_>>();
        assert_eq!(rounds_tried, vec![11]);
    }

    #[tokio::test]
    async fn test_round_is_never_tried_twice() {
        let f = fixture();
        f.rounds.add_rounds(vec![test_queued_round(10, 3, Duration::from_secs(20))]);
        for _ in 0..5 {
            f.comms.push_put_response(Ok(PutMessageResponse { accepted: false }));
        }

        assert!(f.round_sender.send_cmix(message(), quick_params(5)).await.is_err());
        assert_eq!(f.comms.num_put_calls(), 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_aborts() {
        let f = fixture();
        f.rounds.add_rounds(vec![
            test_queued_round(10, 3, Duration::from_secs(20)),
            test_queued_round(11, 3, Duration::from_secs(30)),
        ]);
        f.comms.push_put_response(Err("invalid slot".to_string()));

        let result = f.round_sender.send_cmix(message(), quick_params(5)).await;
        assert!(format!("{:#}", result.unwrap_err()).contains("invalid slot"));
        assert_eq!(f.comms.num_put_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_authorization_removes_key() {
        let f = fixture();
        f.rounds.add_rounds(vec![
            test_queued_round(10, 3, Duration::from_secs(20)),
            test_queued_round(11, 3, Duration::from_secs(30)),
        ]);
        f.comms.push_put_response(Err("could not authenticate client. Is the client registered with this node?".to_string()));

        let result = f.round_sender.send_cmix(message(), quick_params(5)).await;
        assert!(result.is_err());
        assert!(!f.registrar.has_node(&test_node_id(1)));
        assert!(f.registrar.is_pending(&test_node_id(1)));
    }

    #[tokio::test]
    async fn test_missing_keys_trigger_registration() {
        let f = fixture();
        f.rounds.add_rounds(vec![test_queued_round(10, 8, Duration::from_secs(20))]);

        assert!(f.round_sender.send_cmix(message(), quick_params(2)).await.is_err());
        assert_eq!(f.comms.num_put_calls(), 0);
        assert!(f.registrar.is_pending(&test_node_id(7)));
        assert!(f.registrar.is_pending(&test_node_id(8)));
    }

    #[tokio::test]
    async fn test_blacklisted_node() {
        let f = fixture();
        f.rounds.add_rounds(vec![
            test_queued_round(10, 3, Duration::from_secs(20)),
            test_queued_round(11, 2, Duration::from_secs(30)),
        ]);
        let mut params = quick_params(5);
        params.blacklisted_nodes.insert(test_node_id(3));

        let report = f.round_sender.send_cmix(message(), params).await.unwrap();
        assert_eq!(report.round_id, 11);
    }

    #[tokio::test]
    async fn test_send_many() {
        let f = fixture();
        f.rounds.add_rounds(vec![test_queued_round(10, 3, Duration::from_secs(20))]);
        let mut second = message();
        second.recipient = test_id_from_number(201, IdType::User);

        let report = f.round_sender.send_many_cmix(vec![message(), second], quick_params(3)).await.unwrap();
        assert_eq!(report.ephemeral_ids.len(), 2);
        assert_eq!(f.comms.num_put_calls(), 1);
        assert!(f.comms.put_slots().is_empty());
    }
}
