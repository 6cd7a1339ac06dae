use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, instrument, trace, warn};

use crate::follow::round_checker::{CheckOutcome, RoundChecker};
use crate::gateway::comms::{GatewayComms, PollRequest};
use crate::gateway::sender::Sender;
use crate::health::health_tracker::HealthTracker;
use crate::identity::identity_tracker::IdentityTracker;
use crate::primitives::id::Id;
use crate::primitives::ndf::Ndf;
use crate::primitives::round::RoundId;
use crate::rounds::round_cache::RoundCache;
use crate::util::stoppable::StopSignal;

/// A problem in a background task that the application should know about
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorReport {
    pub source: String,
    pub message: String,
    pub fatal: bool,
}

pub type ErrorReporter = Arc<dyn Fn(ErrorReport) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct FollowerParams {
    pub period: Duration,
    /// upper bound for the number of rounds checked per identity and tick
    pub max_rounds_per_tick: usize,
}

impl Default for FollowerParams {
    fn default() -> Self {
        FollowerParams {
            period: Duration::from_secs(1),
            max_rounds_per_tick: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TickSummary {
    pub round_updates: usize,
    pub checked: usize,
    pub routed: usize,
    pub abandoned: usize,
}

/// Polls a random gateway on a fixed period, keeping the NDF and the round cache current and
///  feeding the round checker.
pub struct Follower {
    params: FollowerParams,
    client_id: Id,
    sender: Arc<Sender>,
    comms: Arc<dyn GatewayComms>,
    rounds: Arc<RoundCache>,
    identities: Arc<IdentityTracker>,
    checker: Arc<RoundChecker>,
    health: Arc<HealthTracker>,
    ndf_updates: mpsc::Sender<Ndf>,
    last_tracked_round: AtomicU64,
}

impl Follower {
    pub fn new(
        params: FollowerParams,
        client_id: Id,
        sender: Arc<Sender>,
        comms: Arc<dyn GatewayComms>,
        rounds: Arc<RoundCache>,
        identities: Arc<IdentityTracker>,
        checker: Arc<RoundChecker>,
        health: Arc<HealthTracker>,
        ndf_updates: mpsc::Sender<Ndf>,
    ) -> Follower {
        Follower {
            params,
            client_id,
            sender,
            comms,
            rounds,
            identities,
            checker,
            health,
            ndf_updates,
            last_tracked_round: AtomicU64::new(0),
        }
    }

    pub fn last_tracked_round(&self) -> RoundId {
        self.last_tracked_round.load(Ordering::Acquire)
    }

    #[instrument(level = "trace", skip_all)]
    pub async fn tick(&self, reporter: &ErrorReporter) -> anyhow::Result<TickSummary> {
        let identities = self.identities.identities(SystemTime::now());
        let request = PollRequest {
            client_id: self.client_id,
            partial_ndf_hash: self.rounds.ndf_hash(),
            last_update_id: self.rounds.last_update_id(),
            last_round: self.last_tracked_round(),
            identities: identities.iter().map(|i| i.ephemeral).collect(),
        };

        let comms = &self.comms;
        let request = &request;
        let response = self.sender.send_to_any(|host| async move {
            comms.poll(&host, request).await
        }).await?;
        self.health.contact();

        if let Some(ndf) = response.partial_ndf {
            debug!("received an updated NDF with {} gateways", ndf.gateways.len());
            self.rounds.set_ndf(ndf.clone());
            if let Err(e) = self.ndf_updates.try_send(ndf) {
                warn!("could not queue NDF update for the host pool: {}", e);
            }
        }

        let mut summary = TickSummary {
            round_updates: response.round_updates.len(),
            ..Default::default()
        };
        self.rounds.add_rounds(response.round_updates);
        self.rounds.evict();

        self.last_tracked_round.fetch_max(response.last_tracked_round, Ordering::AcqRel);
        let last_tracked = self.last_tracked_round();

        for identity in &identities {
            let filters = response.filters.iter()
                .find(|f| f.ephemeral_id == identity.ephemeral_id())
                .map(|f| f.filters.as_slice())
                .unwrap_or(&[]);

            // rounds before the gateway's oldest filter are beyond its retention
            if let Some(earliest) = filters.iter().map(|f| f.first_round).min() {
                self.identities.forward(&identity.source, earliest);
            }

            // rounds beyond the newest filter are left for a later tick
            let covered_to = match filters.iter().filter(|f| f.round_range > 0).map(|f| f.last_round()).max() {
                Some(last) => last.min(last_tracked),
                None => {
                    trace!("no filters for {:?} yet", identity.source);
                    continue;
                }
            };

            let unchecked = self.identities.unchecked(&identity.source, covered_to, self.params.max_rounds_per_tick);
            trace!("{} unchecked rounds for {:?}", unchecked.len(), identity.source);

            for round_id in unchecked {
                if !response.known_rounds.checked(round_id) {
                    continue;
                }
                summary.checked += 1;
                match self.checker.check(round_id, identity, filters) {
                    CheckOutcome::Retrieval | CheckOutcome::Historical => summary.routed += 1,
                    CheckOutcome::Abandoned => {
                        summary.abandoned += 1;
                        reporter(ErrorReport {
                            source: "follower".to_string(),
                            message: format!("gave up checking round {} for {:?}", round_id, identity.source),
                            fatal: false,
                        });
                    }
                    _ => {}
                }
            }
        }

        Ok(summary)
    }

    pub async fn run(self: Arc<Self>, reporter: ErrorReporter, stop: StopSignal) {
        let mut interval = time::interval(self.params.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = interval.tick() => {
                    match self.tick(&reporter).await {
                        Ok(summary) => trace!("follower tick: {:?}", summary),
                        Err(e) => {
                            warn!("polling the network failed: {:#}", e);
                            reporter(ErrorReport {
                                source: "follower".to_string(),
                                message: format!("{:#}", e),
                                fatal: false,
                            });
                        }
                    }
                }
                _ = stop.stopped() => break,
            }
        }
        debug!("network follower stopped");
    }
}
