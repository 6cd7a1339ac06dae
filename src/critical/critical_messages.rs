use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashSet;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cmix::params::{CmixParams, SendReport, TargetedMessage};
use crate::cmix::round_sender::RoundSenderApi;
use crate::health::health_tracker::HealthCallback;
use crate::primitives::fingerprint::Fingerprint;
use crate::primitives::id::Id;
use crate::primitives::round::RoundId;
use crate::primitives::service::Service;
use crate::rounds::round_cache::{RoundOutcome, RoundWatcher};
use crate::storage::kv::{KvStore, VersionedObject};
use crate::util::buf::{put_bool, put_bytes, put_string, try_get_array, try_get_bool, try_get_bytes, try_get_string};
use crate::util::stoppable::StopSignal;

pub const CRITICAL_MESSAGES_KEY: &str = "critical/messages";
const CRITICAL_MESSAGES_VERSION: u64 = 0;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum CriticalState {
    /// not sent yet
    Pending = 0,
    /// sent, waiting for the round to finish
    InFlight = 1,
    /// sending or the round failed, resent on the next healthy transition
    Failed = 2,
}

#[derive(Debug, Clone)]
struct CriticalEntry {
    message: TargetedMessage,
    params: CmixParams,
    state: CriticalState,
}

fn ser_message(message: &TargetedMessage, buf: &mut impl BufMut) {
    message.recipient.ser(buf);
    message.fingerprint.ser(buf);
    message.service.ser(buf);
    put_bytes(buf, &message.contents);
    buf.put_slice(&message.mac);
}

fn try_deser_message(buf: &mut impl Buf) -> anyhow::Result<TargetedMessage> {
    Ok(TargetedMessage {
        recipient: Id::try_deser(buf)?,
        fingerprint: Fingerprint::try_deser(buf)?,
        service: Service::try_deser(buf)?,
        contents: try_get_bytes(buf)?,
        mac: try_get_array(buf)?,
    })
}

fn ser_params(params: &CmixParams, buf: &mut impl BufMut) {
    buf.put_u32(params.round_tries);
    buf.put_u64_varint(params.timeout.as_millis() as u64);
    buf.put_u64_varint(params.send_timeout.as_millis() as u64);
    put_string(buf, &params.debug_tag);
    buf.put_usize_varint(params.blacklisted_nodes.len());
    for node in &params.blacklisted_nodes {
        node.ser(buf);
    }
    put_bool(buf, params.critical);
}

fn try_deser_params(buf: &mut impl Buf) -> anyhow::Result<CmixParams> {
    let round_tries = buf.try_get_u32()?;
    let timeout = Duration::from_millis(buf.try_get_u64_varint()?);
    let send_timeout = Duration::from_millis(buf.try_get_u64_varint()?);
    let debug_tag = try_get_string(buf)?;
    let num_blacklisted = buf.try_get_usize_varint()?;
    let mut blacklisted_nodes = FxHashSet::default();
    for _ in 0..num_blacklisted {
        blacklisted_nodes.insert(Id::try_deser(buf)?);
    }
    let critical = try_get_bool(buf)?;
    Ok(CmixParams { round_tries, timeout, send_timeout, debug_tag, blacklisted_nodes, critical })
}

/// the receiving ends of the channels driving [CriticalMessages::run]
pub struct CriticalReceivers {
    trigger: mpsc::Receiver<()>,
    watches: mpsc::Receiver<(u64, RoundId)>,
}

/// Persisted messages that must be delivered eventually. Whenever the network becomes healthy,
///  all messages not delivered yet are sent, and each is removed only once its round completed.
pub struct CriticalMessages {
    sender: Arc<dyn RoundSenderApi>,
    watcher: Arc<dyn RoundWatcher>,
    store: Arc<dyn KvStore>,
    watch_timeout: Duration,
    entries: Mutex<BTreeMap<u64, CriticalEntry>>,
    /// IDs are never reused, not even after a restart
    next_id: AtomicU64,
    trigger: mpsc::Sender<()>,
    watches: mpsc::Sender<(u64, RoundId)>,
}

impl CriticalMessages {
    pub fn new(
        sender: Arc<dyn RoundSenderApi>,
        watcher: Arc<dyn RoundWatcher>,
        store: Arc<dyn KvStore>,
        watch_timeout: Duration,
        queue_capacity: usize,
    ) -> (CriticalMessages, CriticalReceivers) {
        let (next_id, entries) = Self::load(store.as_ref());
        if !entries.is_empty() {
            info!("loaded {} critical messages", entries.len());
        }

        let (trigger, trigger_receiver) = mpsc::channel(1);
        let (watches, watches_receiver) = mpsc::channel(queue_capacity);
        let critical = CriticalMessages {
            sender,
            watcher,
            store,
            watch_timeout,
            entries: Mutex::new(entries),
            next_id: AtomicU64::new(next_id),
            trigger,
            watches,
        };
        let receivers = CriticalReceivers {
            trigger: trigger_receiver,
            watches: watches_receiver,
        };
        (critical, receivers)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn states(&self) -> Vec<CriticalState> {
        self.entries.lock().unwrap()
            .values()
            .map(|e| e.state)
            .collect()
    }

    fn insert(&self, message: TargetedMessage, mut params: CmixParams, state: CriticalState) -> u64 {
        params.critical = false;
        let id = {
            let mut entries = self.entries.lock().unwrap();
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            entries.insert(id, CriticalEntry { message, params, state });
            id
        };
        debug!("added critical message {} ({:?})", id, state);
        self.save();
        id
    }

    /// Stores a message for delivery on the next trigger
    pub fn add(&self, message: TargetedMessage, params: CmixParams) -> u64 {
        self.insert(message, params, CriticalState::Pending)
    }

    /// Stores a message and makes the first delivery attempt right away. If that attempt fails,
    ///  or its round does not complete later on, the message is resent on the next trigger.
    pub async fn send_now(&self, message: TargetedMessage, params: CmixParams) -> anyhow::Result<SendReport> {
        let id = self.insert(message.clone(), params.clone(), CriticalState::InFlight);
        match self.sender.send_cmix(message, params).await {
            Ok(report) => {
                if let Err(e) = self.watches.try_send((id, report.round_id)) {
                    warn!("cannot watch round of critical message {}, it is sent again: {}", id, e);
                    self.set_state(id, CriticalState::Failed);
                }
                Ok(report)
            }
            Err(e) => {
                self.set_state(id, CriticalState::Failed);
                Err(e)
            }
        }
    }

    /// Requests sending all undelivered messages. Triggers coalesce while a resend is running.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// A health callback that triggers a resend on every transition to healthy
    pub fn health_callback(&self) -> HealthCallback {
        let trigger = self.trigger.clone();
        Arc::new(move |healthy| {
            if healthy {
                let _ = trigger.try_send(());
            }
        })
    }

    fn set_state(&self, id: u64, state: CriticalState) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            entry.state = state;
        }
        self.save();
    }

    fn remove(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
        self.save();
    }

    async fn watch(self: Arc<Self>, id: u64, round_id: RoundId) {
        match self.watcher.wait_for_round(round_id, self.watch_timeout).await {
            RoundOutcome::Completed => {
                info!("critical message {} delivered in round {}", id, round_id);
                self.remove(id);
            }
            outcome => {
                warn!("round {} of critical message {} did not complete: {:?}", round_id, id, outcome);
                self.set_state(id, CriticalState::Failed);
            }
        }
    }

    async fn send_one(self: Arc<Self>, id: u64, message: TargetedMessage, params: CmixParams) {
        match self.sender.send_cmix(message, params).await {
            Ok(report) => self.watch(id, report.round_id).await,
            Err(e) => {
                warn!("failed to send critical message {}: {:#}", id, e);
                self.set_state(id, CriticalState::Failed);
            }
        }
    }

    /// Marks all pending and failed messages as in flight and spawns a task sending each of them
    fn spawn_due(self: &Arc<Self>, tasks: &mut JoinSet<()>) -> usize {
        let due = {
            let mut entries = self.entries.lock().unwrap();
            entries.iter_mut()
                .filter(|(_, e)| e.state != CriticalState::InFlight)
                .map(|(&id, e)| {
                    e.state = CriticalState::InFlight;
                    (id, e.message.clone(), e.params.clone())
                })
                .collect::<Vec<_>>()
        };
        if due.is_empty() {
            return 0;
        }
        self.save();
        debug!("sending {} critical messages", due.len());

        let num_due = due.len();
        for (id, message, params) in due {
            tasks.spawn(self.clone().send_one(id, message, params));
        }
        num_due
    }

    /// Sends all pending and failed messages concurrently, returning when each of them has an
    ///  outcome
    pub async fn resend_all(self: &Arc<Self>) -> usize {
        let mut tasks = JoinSet::new();
        let num_sent = self.spawn_due(&mut tasks);
        while let Some(result) = tasks.join_next().await {
            log_join_result(result);
        }
        num_sent
    }

    /// Interrupted sends leave their entries failed, so they are sent again after a restart
    fn fail_in_flight(&self) {
        let mut changed = false;
        for entry in self.entries.lock().unwrap().values_mut() {
            if entry.state == CriticalState::InFlight {
                entry.state = CriticalState::Failed;
                changed = true;
            }
        }
        if changed {
            self.save();
        }
    }

    pub async fn run(self: Arc<Self>, receivers: CriticalReceivers, stop: StopSignal) {
        let CriticalReceivers { mut trigger, mut watches } = receivers;
        let mut tasks = JoinSet::new();

        loop {
            select! {
                t = trigger.recv() => {
                    if t.is_none() {
                        break;
                    }
                    self.spawn_due(&mut tasks);
                }
                w = watches.recv() => {
                    if let Some((id, round_id)) = w {
                        tasks.spawn(self.clone().watch(id, round_id));
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => log_join_result(result),
                _ = stop.stopped() => break,
            }
        }

        if !tasks.is_empty() {
            debug!("aborting {} critical message tasks", tasks.len());
            tasks.shutdown().await;
        }
        self.fail_in_flight();
        debug!("critical message sender stopped");
    }

    fn save(&self) {
        let mut buf = BytesMut::new();
        {
            let entries = self.entries.lock().unwrap();
            buf.put_u64_varint(self.next_id.load(Ordering::Acquire));
            buf.put_usize_varint(entries.len());
            for (id, entry) in entries.iter() {
                buf.put_u64_varint(*id);
                ser_message(&entry.message, &mut buf);
                ser_params(&entry.params, &mut buf);
                buf.put_u8(entry.state.into());
            }
        }
        if let Err(e) = self.store.set(CRITICAL_MESSAGES_KEY, VersionedObject::new(CRITICAL_MESSAGES_VERSION, buf.freeze())) {
            error!("failed to persist critical messages: {}", e);
        }
    }

    /// the next ID to assign and the stored entries
    fn load(store: &dyn KvStore) -> (u64, BTreeMap<u64, CriticalEntry>) {
        let decode = || -> anyhow::Result<(u64, BTreeMap<u64, CriticalEntry>)> {
            let obj = match store.get(CRITICAL_MESSAGES_KEY)? {
                Some(obj) => obj,
                None => return Ok((0, BTreeMap::new())),
            };
            let mut buf = obj.expect_version(CRITICAL_MESSAGES_KEY, CRITICAL_MESSAGES_VERSION)?;
            let mut next_id = buf.try_get_u64_varint()?;
            let len = buf.try_get_usize_varint()?;
            let mut result = BTreeMap::new();
            for _ in 0..len {
                let id = buf.try_get_u64_varint()?;
                let message = try_deser_message(&mut buf)?;
                let params = try_deser_params(&mut buf)?;
                let mut state = CriticalState::try_from(buf.try_get_u8()?)?;
                if state == CriticalState::InFlight {
                    warn!("critical message {} was in flight when the client stopped, marking it failed", id);
                    state = CriticalState::Failed;
                }
                next_id = next_id.max(id + 1);
                result.insert(id, CriticalEntry { message, params, state });
            }
            Ok((next_id, result))
        };

        match decode() {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("could not load critical messages: {}", e);
                (0, BTreeMap::new())
            }
        }
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("critical message task terminated abnormally: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::{always, eq};
    use mockall::Sequence;
    use crate::cmix::params::SendReport;
    use crate::cmix::round_sender::MockRoundSenderApi;
    use crate::health::health_tracker::HealthTracker;
    use crate::primitives::message::MAC_LEN;
    use crate::rounds::round_cache::MockRoundWatcher;
    use crate::storage::kv::MemStore;
    use crate::test_util::identity::test_user_id;
    use crate::test_util::ndf::test_node_id;
    use crate::util::stoppable::Stoppable;
    use super::*;

    fn message(contents: &[u8]) -> TargetedMessage {
        TargetedMessage {
            recipient: test_user_id(2),
            fingerprint: Fingerprint::from_seed(contents),
            service: Service::new(b"recipient".to_vec(), "default", None),
            contents: contents.to_vec(),
            mac: [3u8; MAC_LEN],
        }
    }

    fn report(round_id: u64) -> SendReport {
        SendReport { round_id, ephemeral_ids: Vec::new() }
    }

    fn new_critical(sender: MockRoundSenderApi, watcher: MockRoundWatcher, store: Arc<MemStore>) -> (Arc<CriticalMessages>, CriticalReceivers) {
        let (critical, receivers) = CriticalMessages::new(Arc::new(sender), Arc::new(watcher), store, Duration::from_secs(120), 10);
        (Arc::new(critical), receivers)
    }

    #[tokio::test]
    async fn test_completed_round_removes_message() {
        let mut sender = MockRoundSenderApi::new();
        sender.expect_send_cmix()
            .with(eq(message(b"a")), always())
            .times(1)
            .returning(|_, _| Ok(report(7)));
        let mut watcher = MockRoundWatcher::new();
        watcher.expect_wait_for_round()
            .with(eq(7), always())
            .times(1)
            .return_const(RoundOutcome::Completed);

        let (critical, _trigger) = new_critical(sender, watcher, Arc::new(MemStore::new()));
        critical.add(message(b"a"), CmixParams::default());

        assert_eq!(critical.resend_all().await, 1);
        assert!(critical.is_empty());
    }

    /// a failed round leaves the message in the buffer, the next healthy transition resends it
    #[tokio::test]
    async fn test_failed_round_is_retried_on_next_trigger() {
        let mut seq = Sequence::new();
        let mut sender = MockRoundSenderApi::new();
        sender.expect_send_cmix()
            .times(2)
            .returning(|_, _| Ok(report(7)));
        let mut watcher = MockRoundWatcher::new();
        watcher.expect_wait_for_round()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(RoundOutcome::Failed);
        watcher.expect_wait_for_round()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(RoundOutcome::Completed);

        let (critical, receivers) = new_critical(sender, watcher, Arc::new(MemStore::new()));
        critical.add(message(b"a"), CmixParams::default());

        let health = HealthTracker::new(Duration::from_secs(30));
        health.add_health_callback(critical.health_callback());

        let mut stoppable = Stoppable::new("critical");
        stoppable.spawn("sender", critical.clone().run(receivers, stoppable.signal()));

        health.report(true);
        for _ in 0..100 {
            if critical.states() == vec![CriticalState::Failed] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(critical.states(), vec![CriticalState::Failed]);

        health.report(false);
        health.report(true);
        for _ in 0..100 {
            if critical.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(critical.is_empty());

        stoppable.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_now_watches_round() {
        let mut sender = MockRoundSenderApi::new();
        sender.expect_send_cmix()
            .times(1)
            .returning(|_, _| Ok(report(9)));
        let mut watcher = MockRoundWatcher::new();
        watcher.expect_wait_for_round()
            .with(eq(9), always())
            .times(1)
            .return_const(RoundOutcome::Completed);

        let (critical, receivers) = new_critical(sender, watcher, Arc::new(MemStore::new()));
        let mut stoppable = Stoppable::new("critical");
        stoppable.spawn("sender", critical.clone().run(receivers, stoppable.signal()));

        let report = critical.send_now(message(b"a"), CmixParams::default()).await.unwrap();
        assert_eq!(report.round_id, 9);

        for _ in 0..100 {
            if critical.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(critical.is_empty());

        stoppable.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_now_failure_keeps_message() {
        let mut sender = MockRoundSenderApi::new();
        sender.expect_send_cmix()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("no round available")));

        let (critical, _receivers) = new_critical(sender, MockRoundWatcher::new(), Arc::new(MemStore::new()));
        assert!(critical.send_now(message(b"a"), CmixParams::default()).await.is_err());
        assert_eq!(critical.states(), vec![CriticalState::Failed]);
    }

    #[tokio::test]
    async fn test_stop_fails_in_flight_messages() {
        let mut sender = MockRoundSenderApi::new();
        sender.expect_send_cmix()
            .returning(|_, _| Ok(report(9)));
        let mut watcher = MockRoundWatcher::new();
        watcher.expect_wait_for_round()
            .returning(|_, _| RoundOutcome::TimedOut);

        let (critical, receivers) = new_critical(sender, watcher, Arc::new(MemStore::new()));
        critical.set_state(critical.add(message(b"a"), CmixParams::default()), CriticalState::InFlight);

        let mut stoppable = Stoppable::new("critical");
        stoppable.spawn("sender", critical.clone().run(receivers, stoppable.signal()));
        stoppable.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(critical.states(), vec![CriticalState::Failed]);
    }

    #[tokio::test]
    async fn test_send_error_marks_failed() {
        let mut sender = MockRoundSenderApi::new();
        sender.expect_send_cmix()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("network is not healthy")));
        let mut watcher = MockRoundWatcher::new();
        watcher.expect_wait_for_round().never();

        let (critical, _trigger) = new_critical(sender, watcher, Arc::new(MemStore::new()));
        critical.add(message(b"a"), CmixParams::default());

        critical.resend_all().await;
        assert_eq!(critical.states(), vec![CriticalState::Failed]);
    }

    #[tokio::test]
    async fn test_messages_are_sent_concurrently() {
        let mut sender = MockRoundSenderApi::new();
        sender.expect_send_cmix()
            .times(3)
            .returning(|msg, _| Ok(report(msg.contents[0] as u64)));
        let mut watcher = MockRoundWatcher::new();
        watcher.expect_wait_for_round()
            .times(3)
            .returning(|rid, _| if rid == b'b' as u64 { RoundOutcome::TimedOut } else { RoundOutcome::Completed });

        let (critical, _trigger) = new_critical(sender, watcher, Arc::new(MemStore::new()));
        critical.add(message(b"a"), CmixParams::default());
        critical.add(message(b"b"), CmixParams::default());
        critical.add(message(b"c"), CmixParams::default());

        assert_eq!(critical.resend_all().await, 3);
        assert_eq!(critical.states(), vec![CriticalState::Failed]);
    }

    #[test]
    fn test_persistence() {
        let store = Arc::new(MemStore::new());
        let mut params = CmixParams::default();
        params.round_tries = 3;
        params.blacklisted_nodes.insert(test_node_id(4));
        params.critical = true;
        {
            let (critical, _) = new_critical(MockRoundSenderApi::new(), MockRoundWatcher::new(), store.clone());
            critical.add(message(b"a"), params.clone());
            critical.add(message(b"b"), CmixParams::default());
            critical.set_state(1, CriticalState::InFlight);
        }

        let (critical, _) = new_critical(MockRoundSenderApi::new(), MockRoundWatcher::new(), store);
        assert_eq!(critical.states(), vec![CriticalState::Pending, CriticalState::Failed]);

        let entries = critical.entries.lock().unwrap();
        assert_eq!(entries[&0].message, message(b"a"));
        assert_eq!(entries[&0].params.round_tries, 3);
        assert!(entries[&0].params.blacklisted_nodes.contains(&test_node_id(4)));
        assert!(!entries[&0].params.critical);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let store = Arc::new(MemStore::new());
        {
            let (critical, _) = new_critical(MockRoundSenderApi::new(), MockRoundWatcher::new(), store.clone());
            assert_eq!(critical.add(message(b"a"), CmixParams::default()), 0);
            assert_eq!(critical.add(message(b"b"), CmixParams::default()), 1);
            critical.remove(1);
            assert_eq!(critical.add(message(b"c"), CmixParams::default()), 2);
            critical.remove(2);
            critical.remove(0);
            assert!(critical.is_empty());
        }

        let (critical, _) = new_critical(MockRoundSenderApi::new(), MockRoundWatcher::new(), store);
        assert!(critical.is_empty());
        assert_eq!(critical.add(message(b"d"), CmixParams::default()), 3);
    }
}
