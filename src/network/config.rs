use std::time::Duration;

use anyhow::bail;

use crate::dispatch::handler::UnmatchedParams;
use crate::follow::follower::FollowerParams;
use crate::follow::historical::HistoricalRoundsParams;
use crate::follow::unchecked::UncheckedRoundsParams;
use crate::gateway::host_pool::HostPoolParams;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub follower: FollowerParams,
    pub host_pool: HostPoolParams,
    pub historical: HistoricalRoundsParams,
    pub unchecked: UncheckedRoundsParams,
    pub unmatched: UnmatchedParams,

    /// rounds starting sooner than this are not used for sending
    pub realtime_buffer: Duration,
    pub retrieval_timeout: Duration,
    pub num_retrieval_workers: usize,
    pub num_dispatch_workers: usize,
    pub num_registration_workers: usize,
    /// capacity of the bounded queues between the stages
    pub queue_capacity: usize,
    /// a round that needed checking this many times without being resolved is given up
    pub max_round_check_attempts: u32,

    /// without a successful poll for this long, the network counts as unhealthy
    pub health_timeout: Duration,
    /// how long a critical message waits for its round to complete
    pub critical_watch_timeout: Duration,
    /// rounds are dropped from the round cache after this time
    pub round_retention: Duration,
    /// time for background tasks to acknowledge a stop request
    pub stop_timeout: Duration,
}

impl NetworkConfig {
    pub fn new() -> NetworkConfig {
        NetworkConfig {
            follower: FollowerParams::default(),
            host_pool: HostPoolParams::default(),
            historical: HistoricalRoundsParams::default(),
            unchecked: UncheckedRoundsParams::default(),
            unmatched: UnmatchedParams::default(),
            realtime_buffer: Duration::from_millis(2500),
            retrieval_timeout: Duration::from_secs(3),
            num_retrieval_workers: 4,
            num_dispatch_workers: 4,
            num_registration_workers: 2,
            queue_capacity: 500,
            max_round_check_attempts: 5,
            health_timeout: Duration::from_secs(30),
            critical_watch_timeout: Duration::from_secs(120),
            round_retention: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.follower.period.is_zero() {
            bail!("follower period must not be zero");
        }
        if self.host_pool.max_pool_size == 0 {
            bail!("host pool size must be at least 1");
        }
        if self.host_pool.proxy_attempts == 0 {
            bail!("at least one proxy attempt is required");
        }
        if self.historical.batch_size == 0 {
            bail!("historical round batch size must be at least 1");
        }
        if self.num_retrieval_workers == 0 || self.num_dispatch_workers == 0 || self.num_registration_workers == 0 {
            bail!("every worker pool needs at least one worker");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be at least 1");
        }
        if self.unchecked.interval.is_zero() {
            bail!("unchecked round scheduler interval must not be zero");
        }
        if self.health_timeout < self.follower.period {
            bail!("health timeout must not be shorter than the follower period");
        }

        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        NetworkConfig::new().validate().unwrap();
    }

    #[test]
    fn test_validate() {
        let mut config = NetworkConfig::new();
        config.num_dispatch_workers = 0;
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::new();
        config.health_timeout = Duration::from_millis(10);
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::new();
        config.historical.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
