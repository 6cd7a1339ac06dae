use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{anyhow, bail};
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cmix::params::{CmixParams, SendReport, TargetedMessage};
use crate::cmix::round_sender::{RoundSender, RoundSenderApi};
use crate::critical::critical_messages::{CriticalMessages, CriticalReceivers};
use crate::crypto::MixCrypto;
use crate::dispatch::handler::{Bundle, Handler};
use crate::dispatch::processor::MessageProcessor;
use crate::follow::follower::{ErrorReporter, Follower};
use crate::follow::historical::{HistoricalRequest, HistoricalRounds};
use crate::follow::processing::ProcessingRounds;
use crate::follow::retrieval::{MessageRetrieval, RoundLookup};
use crate::follow::round_checker::RoundChecker;
use crate::follow::unchecked::{RetryTargets, UncheckedRounds};
use crate::gateway::comms::GatewayComms;
use crate::gateway::host_pool::HostPool;
use crate::gateway::sender::Sender;
use crate::health::health_tracker::{HealthCallback, HealthTracker};
use crate::identity::identity_tracker::{IdentityTracker, ReceptionIdentity};
use crate::network::config::NetworkConfig;
use crate::nodes::registrar::Registrar;
use crate::primitives::fingerprint::Fingerprint;
use crate::primitives::id::Id;
use crate::primitives::ndf::Ndf;
use crate::primitives::round::{RoundId, RoundInfo};
use crate::primitives::service::Service;
use crate::rounds::round_cache::{RoundCache, RoundWatcher};
use crate::storage::kv::KvStore;
use crate::util::stoppable::{StopSignal, Stoppable};

/// receiving ends of the queues between the stages, handed to the tasks spawned by
///  [Network::follow]
struct Queues {
    registration: mpsc::Receiver<Id>,
    historical: mpsc::Receiver<HistoricalRequest>,
    retrieval: mpsc::Receiver<RoundLookup>,
    dispatch: mpsc::Receiver<Bundle>,
    ndf_updates: mpsc::Receiver<Ndf>,
    critical: CriticalReceivers,
    retry_targets: RetryTargets,
}

/// The network engine: owns all components, wires them together and exposes the operations
///  higher layers build on.
pub struct Network {
    config: NetworkConfig,
    comms: Arc<dyn GatewayComms>,
    pool: Arc<HostPool>,
    sender: Arc<Sender>,
    rounds: Arc<RoundCache>,
    health: Arc<HealthTracker>,
    registrar: Arc<Registrar>,
    identities: Arc<IdentityTracker>,
    handler: Arc<Handler>,
    unchecked: Arc<UncheckedRounds>,
    historical: Arc<HistoricalRounds>,
    retrieval: Arc<MessageRetrieval>,
    round_sender: Arc<RoundSender>,
    critical: Arc<CriticalMessages>,
    follower: Arc<Follower>,
    queues: Mutex<Option<Queues>>,
}

impl Network {
    pub fn new(
        config: NetworkConfig,
        client_id: Id,
        ndf: Ndf,
        comms: Arc<dyn GatewayComms>,
        crypto: Arc<dyn MixCrypto>,
        store: Arc<dyn KvStore>,
    ) -> anyhow::Result<Network> {
        config.validate()?;
        let capacity = config.queue_capacity;

        let rounds = Arc::new(RoundCache::new(config.round_retention));
        rounds.set_ndf(ndf.clone());

        let pool = Arc::new(HostPool::new(config.host_pool.clone(), ndf, store.clone())?);
        let sender = Arc::new(Sender::new(pool.clone()));
        let health = Arc::new(HealthTracker::new(config.health_timeout));

        let (registrar, registration) = Registrar::new(client_id, crypto.clone(), store.clone(), capacity);
        let registrar = Arc::new(registrar);

        let identities = Arc::new(IdentityTracker::new(store.clone()));
        let handler = Arc::new(Handler::new(config.unmatched));
        let processing = Arc::new(ProcessingRounds::new());
        let unchecked = Arc::new(UncheckedRounds::new(config.unchecked, store.clone()));

        let (retrieval_queue, retrieval_receiver) = mpsc::channel(capacity);
        let (dispatch_queue, dispatch_receiver) = mpsc::channel(capacity);
        let (ndf_updates, ndf_receiver) = mpsc::channel(16);

        let (historical, historical_receiver) = HistoricalRounds::new(
            config.historical.clone(),
            sender.clone(),
            comms.clone(),
            rounds.clone(),
            processing.clone(),
            retrieval_queue.clone(),
            capacity,
        );
        let historical = Arc::new(historical);

        let retrieval = Arc::new(MessageRetrieval::new(
            sender.clone(),
            comms.clone(),
            processing.clone(),
            identities.clone(),
            unchecked.clone(),
            dispatch_queue,
            config.retrieval_timeout,
        ));

        let round_sender = Arc::new(RoundSender::new(
            client_id,
            sender.clone(),
            comms.clone(),
            rounds.clone(),
            registrar.clone(),
            crypto,
            health.clone(),
            config.realtime_buffer,
        ));

        let (critical, critical_receivers) = CriticalMessages::new(
            round_sender.clone(),
            rounds.clone() as Arc<dyn RoundWatcher>,
            store,
            config.critical_watch_timeout,
            capacity,
        );
        let critical = Arc::new(critical);
        health.add_health_callback(critical.health_callback());

        let retry_targets = RetryTargets {
            rounds: rounds.clone(),
            identities: identities.clone(),
            processing: processing.clone(),
            historical: historical.clone(),
            retrieval: retrieval_queue.clone(),
        };

        let checker = Arc::new(RoundChecker::new(
            identities.clone(),
            processing,
            rounds.clone(),
            unchecked.clone(),
            historical.clone(),
            retrieval_queue,
            config.max_round_check_attempts,
        ));

        let follower = Arc::new(Follower::new(
            config.follower,
            client_id,
            sender.clone(),
            comms.clone(),
            rounds.clone(),
            identities.clone(),
            checker,
            health.clone(),
            ndf_updates,
        ));

        let queues = Queues {
            registration,
            historical: historical_receiver,
            retrieval: retrieval_receiver,
            dispatch: dispatch_receiver,
            ndf_updates: ndf_receiver,
            critical: critical_receivers,
            retry_targets,
        };

        Ok(Network {
            config,
            comms,
            pool,
            sender,
            rounds,
            health,
            registrar,
            identities,
            handler,
            unchecked,
            historical,
            retrieval,
            round_sender,
            critical,
            follower,
            queues: Mutex::new(Some(queues)),
        })
    }

    /// Starts all background tasks. Errors reported by them are passed to `reporter`. The
    ///  returned [Stoppable] stops them again; a network can be followed only once.
    pub fn follow(&self, reporter: ErrorReporter) -> anyhow::Result<Stoppable> {
        let queues = self.queues.lock().unwrap()
            .take()
            .ok_or_else(|| anyhow!("the network is followed already"))?;
        info!("starting to follow the network");

        let mut stoppable = Stoppable::new("network");

        stoppable.spawn("follower", self.follower.clone().run(reporter, stoppable.signal()));
        stoppable.spawn("health-monitor", self.health.clone().run_timeout_monitor(stoppable.signal()));
        stoppable.spawn("historical-rounds", self.historical.clone().run(queues.historical, stoppable.signal()));
        stoppable.spawn("unchecked-rounds", self.unchecked.clone().run_scheduler(queues.retry_targets, stoppable.signal()));
        stoppable.spawn("critical-messages", self.critical.clone().run(queues.critical, stoppable.signal()));
        stoppable.spawn("host-pool-maintenance", run_host_pool_maintenance(
            self.pool.clone(),
            self.registrar.clone(),
            queues.ndf_updates,
            stoppable.signal(),
        ));

        let retrieval = Arc::new(tokio::sync::Mutex::new(queues.retrieval));
        for i in 0..self.config.num_retrieval_workers {
            stoppable.spawn(format!("retrieval-{}", i), self.retrieval.clone().run_worker(retrieval.clone(), stoppable.signal()));
        }

        let dispatch = Arc::new(tokio::sync::Mutex::new(queues.dispatch));
        for i in 0..self.config.num_dispatch_workers {
            stoppable.spawn(format!("dispatch-{}", i), self.handler.clone().run_worker(dispatch.clone(), stoppable.signal()));
        }

        let registration = Arc::new(tokio::sync::Mutex::new(queues.registration));
        for i in 0..self.config.num_registration_workers {
            stoppable.spawn(format!("registration-{}", i), self.registrar.clone().run_registration_worker(
                registration.clone(),
                self.sender.clone(),
                self.comms.clone(),
                stoppable.signal(),
            ));
        }

        for node_id in self.pool.ndf().nodes.iter().map(|n| n.id) {
            if !self.registrar.has_node(&node_id) {
                self.registrar.trigger_registration(&node_id);
            }
        }

        Ok(stoppable)
    }

    /// Sends a message in the first suitable round. With `params.critical` set, the message is
    ///  persisted first and resent until its round completes.
    pub async fn send_cmix(&self, message: TargetedMessage, params: CmixParams) -> anyhow::Result<SendReport> {
        if params.critical {
            return self.critical.send_now(message, params).await;
        }
        self.round_sender.send_cmix(message, params).await
    }

    /// Sends all messages in the same round
    pub async fn send_many_cmix(&self, messages: Vec<TargetedMessage>, params: CmixParams) -> anyhow::Result<SendReport> {
        if params.critical {
            bail!("critical delivery is supported for single messages only");
        }
        self.round_sender.send_many_cmix(messages, params).await
    }

    /// Queues a message for guaranteed delivery without an immediate attempt. It is sent right
    ///  away if the network is healthy, and on every transition to healthy otherwise.
    pub fn send_critical(&self, message: TargetedMessage, params: CmixParams) -> u64 {
        let id = self.critical.add(message, params);
        if self.health.is_healthy() {
            self.critical.trigger();
        }
        id
    }

    pub fn num_critical_messages(&self) -> usize {
        self.critical.len()
    }

    pub fn add_fingerprint(&self, client_id: Id, fingerprint: Fingerprint, processor: Arc<dyn MessageProcessor>) -> anyhow::Result<()> {
        self.handler.fingerprints().add(client_id, fingerprint, processor)?;
        self.handler.check_unmatched_messages();
        Ok(())
    }

    pub fn delete_fingerprint(&self, client_id: &Id, fingerprint: &Fingerprint) {
        self.handler.fingerprints().delete(client_id, fingerprint);
    }

    pub fn add_service(&self, client_id: Id, service: Service, processor: Arc<dyn MessageProcessor>) {
        self.handler.services().add(client_id, service, processor);
        self.handler.check_unmatched_messages();
    }

    pub fn delete_service(&self, client_id: &Id, service: &Service) -> bool {
        self.handler.services().delete(client_id, service)
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn add_health_callback(&self, callback: HealthCallback) -> u64 {
        self.health.add_health_callback(callback)
    }

    pub fn remove_health_callback(&self, id: u64) {
        self.health.remove_health_callback(id)
    }

    /// Looks up a round that may be too old for the round cache. Requires the network to be
    ///  followed.
    pub async fn lookup_historical_round(&self, round_id: RoundId) -> anyhow::Result<RoundInfo> {
        self.historical.lookup(round_id).await
    }

    /// Starts picking up messages for an identity, from the most recent round on
    pub fn add_identity(&self, source: Id, address_space_size: u8) -> bool {
        self.identities.add_identity(source, address_space_size, self.follower.last_tracked_round())
    }

    /// Stops picking up messages for an identity and drops its fingerprints and services
    pub fn remove_identity(&self, source: &Id) -> bool {
        self.handler.fingerprints().delete_client(source);
        self.handler.services().delete_client(source);
        self.identities.remove_identity(source)
    }

    pub fn identities(&self) -> Vec<ReceptionIdentity> {
        self.identities.identities(SystemTime::now())
    }

    pub fn host_pool(&self) -> &Arc<HostPool> {
        &self.pool
    }

    pub fn round_cache(&self) -> &Arc<RoundCache> {
        &self.rounds
    }
}

/// Applies NDF updates from the follower to the host pool, so the follower never waits for the
///  pool. Nodes behind new gateways are registered with, keys of removed ones dropped.
async fn run_host_pool_maintenance(
    pool: Arc<HostPool>,
    registrar: Arc<Registrar>,
    mut ndf_updates: mpsc::Receiver<Ndf>,
    stop: StopSignal,
) {
    loop {
        let ndf = select! {
            ndf = ndf_updates.recv() => ndf,
            _ = stop.stopped() => None,
        };
        let ndf = match ndf {
            Some(ndf) => ndf,
            None => break,
        };

        let diff = pool.update_ndf(ndf);
        for gateway in &diff.added {
            let node_id = gateway.id.to_node_id();
            if !registrar.has_node(&node_id) {
                registrar.trigger_registration(&node_id);
            }
        }
        for gateway_id in &diff.removed {
            registrar.remove_node(&gateway_id.to_node_id());
        }
    }
    debug!("host pool maintenance stopped");
}
