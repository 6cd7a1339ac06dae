use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, instrument, trace, warn};

use crate::follow::processing::ProcessingRounds;
use crate::follow::retrieval::RoundLookup;
use crate::gateway::comms::GatewayComms;
use crate::gateway::sender::Sender;
use crate::identity::identity_tracker::ReceptionIdentity;
use crate::primitives::round::{RoundId, RoundInfo};
use crate::rounds::round_cache::RoundCache;
use crate::util::stoppable::StopSignal;

#[derive(Debug, Clone)]
pub struct HistoricalRoundsParams {
    /// a batch is sent as soon as it has this many requests
    pub batch_size: usize,
    /// a batch is sent at the latest this long after its first request arrived
    pub debounce: Duration,
    pub rpc_timeout: Duration,
    /// lookups of rounds no gateway knows are given up after this many attempts
    pub max_attempts: u32,
}

impl Default for HistoricalRoundsParams {
    fn default() -> Self {
        HistoricalRoundsParams {
            batch_size: 20,
            debounce: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

/// A queued lookup. If it is done on behalf of an identity, a round that is found is passed on
///  to message retrieval for that identity.
#[derive(Debug)]
pub struct HistoricalRequest {
    pub round_id: RoundId,
    pub identity: Option<ReceptionIdentity>,
    pub attempts: u32,
    pub reply: Option<oneshot::Sender<anyhow::Result<RoundInfo>>>,
}

impl HistoricalRequest {
    fn resolve(&mut self, result: anyhow::Result<RoundInfo>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// Looks up rounds that are too old to be in the round cache, coalescing requests into
///  batches.
pub struct HistoricalRounds {
    params: HistoricalRoundsParams,
    sender: Arc<Sender>,
    comms: Arc<dyn GatewayComms>,
    rounds: Arc<RoundCache>,
    processing: Arc<ProcessingRounds>,
    retrieval: mpsc::Sender<RoundLookup>,
    input: mpsc::Sender<HistoricalRequest>,
}

impl HistoricalRounds {
    pub fn new(
        params: HistoricalRoundsParams,
        sender: Arc<Sender>,
        comms: Arc<dyn GatewayComms>,
        rounds: Arc<RoundCache>,
        processing: Arc<ProcessingRounds>,
        retrieval: mpsc::Sender<RoundLookup>,
        queue_capacity: usize,
    ) -> (HistoricalRounds, mpsc::Receiver<HistoricalRequest>) {
        let (input, receiver) = mpsc::channel(queue_capacity);
        let historical = HistoricalRounds {
            params,
            sender,
            comms,
            rounds,
            processing,
            retrieval,
            input,
        };
        (historical, receiver)
    }

    /// Queues a lookup without waiting. Returns false if the queue is full.
    pub fn request(&self, round_id: RoundId, identity: Option<ReceptionIdentity>) -> bool {
        let request = HistoricalRequest {
            round_id,
            identity,
            attempts: 0,
            reply: None,
        };
        match self.input.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                debug!("could not queue historical lookup of round {}: {}", round_id, e);
                false
            }
        }
    }

    /// Looks up a round, from the round cache if possible
    pub async fn lookup(&self, round_id: RoundId) -> anyhow::Result<RoundInfo> {
        if let Some(round) = self.rounds.get_round(round_id) {
            if round.state.is_terminal() {
                return Ok(round);
            }
        }

        let (reply, result) = oneshot::channel();
        self.input.send(HistoricalRequest {
            round_id,
            identity: None,
            attempts: 0,
            reply: Some(reply),
        }).await
            .map_err(|_| anyhow!("historical round lookup is not running"))?;

        match result.await {
            Ok(result) => result,
            Err(_) => bail!("historical round lookup of round {} was dropped", round_id),
        }
    }

    #[instrument(level = "debug", skip_all, fields(batch_size = batch.len()))]
    async fn process_batch(&self, batch: Vec<HistoricalRequest>) {
        let round_ids = batch.iter()
            .map(|r| r.round_id)
            .collect::<Vec<_>>();
        trace!("looking up rounds {:?}", round_ids);

        let timeout = self.params.rpc_timeout;
        let comms = &self.comms;
        let ids = &round_ids;
        let response = self.sender.send_to_any(|host| async move {
            comms.request_historical_rounds(&host, ids, timeout).await
        }).await;

        let found = match response {
            Ok(found) => found,
            Err(e) => {
                warn!("historical round lookup failed: {:#}", e);
                Vec::new()
            }
        };

        for (idx, mut request) in batch.into_iter().enumerate() {
            match found.get(idx).cloned().flatten() {
                Some(round) if round.id == request.round_id => self.handle_found(request, round).await,
                _ => {
                    request.attempts += 1;
                    if request.attempts < self.params.max_attempts {
                        trace!("round {} not found, retrying (attempt {})", request.round_id, request.attempts);
                        self.requeue(request);
                    }
                    else {
                        warn!("round {} not found after {} attempts, giving up", request.round_id, request.attempts);
                        if let Some(identity) = &request.identity {
                            self.processing.fail(request.round_id, identity);
                        }
                        let round_id = request.round_id;
                        request.resolve(Err(anyhow!("round {} could not be found", round_id)));
                    }
                }
            }
        }
    }

    async fn handle_found(&self, mut request: HistoricalRequest, round: RoundInfo) {
        self.rounds.add_rounds(vec![round.clone()]);
        request.resolve(Ok(round.clone()));

        if let Some(identity) = request.identity {
            let round_id = round.id;
            if self.retrieval.send(RoundLookup { round, identity: identity.clone() }).await.is_err() {
                debug!("message retrieval is not running, dropping round {}", round_id);
                self.processing.fail(round_id, &identity);
            }
        }
    }

    fn requeue(&self, request: HistoricalRequest) {
        if let Err(e) = self.input.try_send(request) {
            let mut request = e.into_inner();
            warn!("historical lookup queue is full, dropping request for round {}", request.round_id);
            if let Some(identity) = &request.identity {
                self.processing.fail(request.round_id, identity);
            }
            let round_id = request.round_id;
            request.resolve(Err(anyhow!("lookup of round {} was dropped", round_id)));
        }
    }

    pub async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<HistoricalRequest>, stop: StopSignal) {
        let mut batch = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let timer = async {
                match deadline {
                    Some(d) => time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };

            select! {
                request = receiver.recv() => {
                    match request {
                        Some(request) => {
                            if batch.is_empty() {
                                deadline = Some(Instant::now() + self.params.debounce);
                            }
                            batch.push(request);
                            if batch.len() >= self.params.batch_size {
                                deadline = None;
                                self.process_batch(std::mem::take(&mut batch)).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = timer => {
                    deadline = None;
                    self.process_batch(std::mem::take(&mut batch)).await;
                }
                _ = stop.stopped() => break,
            }
        }

        // the receiver is gone after this, so pending lookups are answered rather than requeued.
        //  Rounds looked up for an identity stay in the unchecked round store and are retried
        //  from there.
        receiver.close();
        while let Ok(request) = receiver.try_recv() {
            batch.push(request);
        }
        if !batch.is_empty() {
            debug!("dropping {} pending historical lookups on stop", batch.len());
        }
        for mut request in batch {
            if let Some(identity) = &request.identity {
                self.processing.release(request.round_id, identity);
            }
            let round_id = request.round_id;
            request.resolve(Err(anyhow!("historical round lookup of round {} was stopped", round_id)));
        }
        debug!("historical rounds retriever stopped");
    }
}
