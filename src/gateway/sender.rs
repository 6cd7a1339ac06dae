use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::gateway::host::Host;
use crate::gateway::host_pool::HostPool;
use crate::primitives::id::Id;

/// Sends requests through the [HostPool], falling back to other gateways (proxies) and replacing
///  gateways that fail with an error from the pool's replacement list.
///
/// Errors that are not in the replacement list come from the application level at the target
///  gateway (e.g. round contention), so they are returned to the caller instead of trying
///  another proxy.
pub struct Sender {
    pool: Arc<HostPool>,
}

impl Sender {
    pub fn new(pool: Arc<HostPool>) -> Sender {
        Sender { pool }
    }

    pub fn pool(&self) -> &Arc<HostPool> {
        &self.pool
    }

    fn handle_error(&self, host: &Host, error: &anyhow::Error) -> bool {
        let num_errors = host.record_send_error();
        match self.pool.check_replace(&host.id(), error) {
            Ok(replaced) => {
                debug!("send through {:?} failed ({} errors so far), replaced: {}: {}", host, num_errors, replaced, error);
                replaced || self.pool.is_replacement_error(&format!("{:#}", error))
            }
            Err(e) => {
                warn!("could not replace gateway {:?}: {}", host, e);
                true
            }
        }
    }

    /// Tries random pool members until one of them succeeds, at most the pool's configured
    ///  number of proxy attempts. An error that does not point at the gateway ends the attempts.
    pub async fn send_to_any<T, F, Fut>(&self, send: F) -> anyhow::Result<T>
    where
        F: Fn(Arc<Host>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let proxies = self.pool.get_any(self.pool.params().proxy_attempts, &[]);
        if proxies.is_empty() {
            bail!("no gateway available in the host pool");
        }

        let mut last_error = None;
        for proxy in proxies {
            trace!("sending to any: trying {:?}", proxy);
            match send(proxy.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !self.handle_error(&proxy, &e) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("no gateway attempted"))
            .context("unable to send to any gateway"))
    }

    /// Sends to `target` directly, falling back to sending through random proxies if the target
    ///  fails with a replaceable error. The closure receives the host to talk to and the
    ///  actual target.
    pub async fn send_to_specific<T, F, Fut>(&self, target: &Id, send: F) -> anyhow::Result<T>
    where
        F: Fn(Arc<Host>, Id) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(host) = self.pool.get_specific(target) {
            match send(host.clone(), *target).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !self.handle_error(&host, &e) {
                        return Err(e);
                    }
                    debug!("sending to {:?} directly failed, trying proxies: {}", target, e);
                }
            }
        }

        let proxies = self.pool.get_any(self.pool.params().proxy_attempts, &[*target]);
        let mut last_error = None;
        for proxy in proxies {
            trace!("sending to {:?} through proxy {:?}", target, proxy);
            match send(proxy.clone(), *target).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !self.handle_error(&proxy, &e) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("no proxy available"))
            .context(format!("unable to send to {:?}", target)))
    }

    /// Tries each target through [HostPool::get_preferred], then cycles through random proxies
    ///  for all targets. Each call of `send` is bounded by the time remaining from `timeout`,
    ///  and the remaining time is passed to the closure for the request itself.
    pub async fn send_to_preferred<T, F, Fut>(&self, targets: &[Id], send: F, timeout: Duration) -> anyhow::Result<T>
    where
        F: Fn(Arc<Host>, Id, Duration) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if targets.is_empty() {
            bail!("no target gateway");
        }
        let deadline = time::Instant::now() + timeout;

        let attempt = |host: Arc<Host>, target: Id| {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            let fut = send(host, target, remaining);
            async move {
                if remaining.is_zero() {
                    bail!("timed out sending to {:?}", target);
                }
                match time::timeout(remaining, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("context deadline exceeded sending to {:?}", target)),
                }
            }
        };

        let mut last_error = None;
        for (target, host) in targets.iter().zip(self.pool.get_preferred(targets)) {
            trace!("sending to preferred {:?} through {:?}", target, host);
            match attempt(host.clone(), *target).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !self.handle_error(&host, &e) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        let proxy_attempts = self.pool.params().proxy_attempts;
        let proxies = targets.iter()
            .map(|_| self.pool.get_any(proxy_attempts, targets))
            .collect::<Vec<_>>();

        for round in 0..proxy_attempts {
            for (target, target_proxies) in targets.iter().zip(&proxies) {
                if time::Instant::now() >= deadline {
                    return Err(last_error
                        .unwrap_or_else(|| anyhow!("no gateway attempted"))
                        .context(format!("timed out sending to preferred targets {:?}", targets)));
                }
                let proxy = match target_proxies.get(round) {
                    Some(p) => p.clone(),
                    None => continue,
                };
                trace!("sending to {:?} through proxy {:?}", target, proxy);
                match attempt(proxy.clone(), *target).await {
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        if !self.handle_error(&proxy, &e) {
                            return Err(e);
                        }
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("no gateway attempted"))
            .context(format!("unable to send to preferred targets {:?}", targets)))
    }
}
