use std::sync::{Arc, RwLock};

use anyhow::bail;
use bytes::BytesMut;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, trace, warn};

use crate::gateway::host::Host;
use crate::primitives::id::Id;
use crate::primitives::ndf::{GatewayInfo, Ndf, NdfDiff};
use crate::storage::kv::{KvStore, VersionedObject};
use crate::util::random::random_index;

pub const HOST_LIST_KEY: &str = "hostPool/hostList";
const HOST_LIST_VERSION: u64 = 0;

/// errors returned by a gateway that indicate the gateway itself is the problem
pub fn default_replacement_errors() -> Vec<String> {
    [
        "context deadline exceeded",
        "connection refused",
        "host disconnected",
        "transport is closing",
        "all SubConns are in TransientFailure",
        "Last try to connect",
        "no NDF",
        "Host is in cool down",
        "grpc: the client connection is closing",
        "too many proxies",
        "Failed to fetch",
        "connection reset by peer",
    ].iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct HostPoolParams {
    pub max_pool_size: usize,
    /// number of proxies tried per target before giving up
    pub proxy_attempts: usize,
    /// a send error containing one of these substrings gets the gateway replaced
    pub replacement_errors: Vec<String>,
}

impl Default for HostPoolParams {
    fn default() -> Self {
        HostPoolParams {
            max_pool_size: 30,
            proxy_attempts: 5,
            replacement_errors: default_replacement_errors(),
        }
    }
}

/// Decides which gateways may enter the pool, e.g. for geographic preferences
pub type GatewayFilter = Arc<dyn Fn(&GatewayInfo) -> bool + Send + Sync>;

/// `ceil(sqrt(gateway_count))`, capped at `max_pool_size`
pub fn pool_size(gateway_count: usize, max_pool_size: usize) -> usize {
    let mut root = (gateway_count as f64).sqrt() as usize;
    while root * root < gateway_count {
        root += 1;
    }
    while root > 0 && (root - 1) * (root - 1) >= gateway_count {
        root -= 1;
    }
    root.min(max_pool_size)
}

struct PoolState {
    ndf: Ndf,
    /// every gateway in the current NDF
    hosts: FxHashMap<Id, Arc<Host>>,
    /// the pool proper; its length never changes after construction
    slots: Vec<Option<Arc<Host>>>,
    /// gateway ID -> index into `slots` for all occupied slots
    slot_index: FxHashMap<Id, usize>,
}

impl PoolState {
    fn occupied(&self) -> Vec<Arc<Host>> {
        self.slots.iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn is_candidate(&self, gateway: &GatewayInfo, filter: Option<&GatewayFilter>) -> bool {
        !self.slot_index.contains_key(&gateway.id)
            && self.hosts.contains_key(&gateway.id)
            && !self.ndf.is_gateway_stale(&gateway.id)
            && filter.map(|f| f(gateway)).unwrap_or(true)
    }

    /// uniformly random gateway from the NDF that is neither stale, filtered out, nor in the pool already
    fn pick_replacement(&self, filter: Option<&GatewayFilter>) -> Option<Arc<Host>> {
        let candidates = self.ndf.gateways.iter()
            .filter(|g| self.is_candidate(g, filter))
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return None;
        }
        let picked = candidates[random_index(candidates.len(), &mut rand::rng())];
        self.hosts.get(&picked.id).cloned()
    }

    /// puts `new_host` into slot `index`, keeping `slots` and `slot_index` in agreement and
    ///  disconnecting the evicted host
    fn replace_slot(&mut self, index: usize, new_host: Option<Arc<Host>>) {
        if let Some(old) = self.slots[index].take() {
            self.slot_index.remove(&old.id());
            old.disconnect();
            debug!("evicted gateway {:?} from pool slot {}", old.id(), index);
        }
        if let Some(new_host) = new_host {
            new_host.connect();
            self.slot_index.insert(new_host.id(), index);
            debug!("added gateway {:?} to pool slot {}", new_host.id(), index);
            self.slots[index] = Some(new_host);
        }
    }

    fn fill_empty_slots(&mut self, filter: Option<&GatewayFilter>) {
        for index in 0..self.slots.len() {
            if self.slots[index].is_none() {
                let replacement = self.pick_replacement(filter);
                if replacement.is_none() {
                    warn!("no eligible gateway available for pool slot {}", index);
                    break;
                }
                self.replace_slot(index, replacement);
            }
        }
    }

    fn host_ids(&self) -> Vec<Id> {
        self.slots.iter()
            .flatten()
            .map(|h| h.id())
            .collect()
    }
}

/// A fixed-size set of gateways the client sends through. Gateways that fail with an error from
///  the configured list are replaced by a random gateway from the NDF, and the occupied IDs are
///  persisted so a restarted client can reuse a known-good pool.
pub struct HostPool {
    params: HostPoolParams,
    store: Arc<dyn KvStore>,
    state: RwLock<PoolState>,
    filter: RwLock<Option<GatewayFilter>>,
}

impl HostPool {
    pub fn new(params: HostPoolParams, ndf: Ndf, store: Arc<dyn KvStore>) -> anyhow::Result<HostPool> {
        if ndf.gateways.is_empty() {
            bail!("cannot initialize the host pool: the NDF contains no gateways");
        }
        if params.max_pool_size == 0 {
            bail!("the maximum host pool size must be positive");
        }

        let size = pool_size(ndf.gateways.len(), params.max_pool_size);
        info!("initializing host pool with {} of {} gateways", size, ndf.gateways.len());

        let hosts = ndf.gateways.iter()
            .map(|g| (g.id, Arc::new(Host::new(g))))
            .collect();

        let mut state = PoolState {
            ndf,
            hosts,
            slots: vec![None; size],
            slot_index: FxHashMap::default(),
        };

        let persisted = Self::load_host_list(store.as_ref());
        let mut next_slot = 0;
        for id in persisted {
            if next_slot >= size {
                break;
            }
            let host = match state.hosts.get(&id) {
                Some(h) => h.clone(),
                None => continue,
            };
            if state.slot_index.contains_key(&id) || state.ndf.is_gateway_stale(&id) {
                continue;
            }
            trace!("reseeding pool slot {} with persisted gateway {:?}", next_slot, id);
            state.replace_slot(next_slot, Some(host));
            next_slot += 1;
        }
        state.fill_empty_slots(None);

        let pool = HostPool {
            params,
            store,
            state: RwLock::new(state),
            filter: RwLock::new(None),
        };
        pool.save_host_list();
        Ok(pool)
    }

    pub fn params(&self) -> &HostPoolParams {
        &self.params
    }

    /// number of slots, occupied or not
    pub fn size(&self) -> usize {
        self.state.read().unwrap().slots.len()
    }

    pub fn host_ids(&self) -> Vec<Id> {
        self.state.read().unwrap().host_ids()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.state.read().unwrap().slot_index.contains_key(id)
    }

    pub fn ndf(&self) -> Ndf {
        self.state.read().unwrap().ndf.clone()
    }

    pub fn set_filter(&self, filter: GatewayFilter) {
        *self.filter.write().unwrap() = Some(filter);
    }

    fn current_filter(&self) -> Option<GatewayFilter> {
        self.filter.read().unwrap().clone()
    }

    /// Up to `n` distinct hosts picked uniformly at random from the occupied slots, skipping
    ///  `excluded`.
    pub fn get_any(&self, n: usize, excluded: &[Id]) -> Vec<Arc<Host>> {
        let mut candidates = self.state.read().unwrap()
            .occupied()
            .into_iter()
            .filter(|h| !excluded.contains(&h.id()))
            .collect::<Vec<_>>();

        let mut rng = rand::rng();
        let mut result = Vec::with_capacity(n.min(candidates.len()));
        while result.len() < n && !candidates.is_empty() {
            let idx = random_index(candidates.len(), &mut rng);
            result.push(candidates.swap_remove(idx));
        }
        result
    }

    /// any gateway from the NDF, whether it is in the pool or not
    pub fn get_specific(&self, id: &Id) -> Option<Arc<Host>> {
        self.state.read().unwrap()
            .hosts
            .get(id)
            .cloned()
    }

    /// One host per target: the target itself if it is in the pool, otherwise a random pool member
    ///  that is neither a target nor picked for another target already (as long as there are
    ///  enough pool members). The result is aligned with `targets` unless the pool is empty.
    pub fn get_preferred(&self, targets: &[Id]) -> Vec<Arc<Host>> {
        let state = self.state.read().unwrap();

        let mut used = targets.iter()
            .filter(|t| state.slot_index.contains_key(t))
            .cloned()
            .collect::<FxHashSet<_>>();

        let mut result = Vec::with_capacity(targets.len());
        let mut rng = rand::rng();
        for target in targets {
            if let Some(&idx) = state.slot_index.get(target) {
                if let Some(host) = &state.slots[idx] {
                    result.push(host.clone());
                    continue;
                }
            }

            let mut candidates = state.occupied()
                .into_iter()
                .filter(|h| !used.contains(&h.id()))
                .collect::<Vec<_>>();
            if candidates.is_empty() {
                // more targets than pool members: proxies are shared
                candidates = state.occupied();
            }
            if candidates.is_empty() {
                continue;
            }
            let host = candidates[random_index(candidates.len(), &mut rng)].clone();
            used.insert(host.id());
            result.push(host);
        }
        result
    }

    /// true if `error` is in the configured list of errors that get a gateway replaced
    pub fn is_replacement_error(&self, error: &str) -> bool {
        self.params.replacement_errors.iter()
            .any(|e| error.contains(e.as_str()))
    }

    /// Replaces the host if the error matches the replacement list. Other errors are logged and
    ///  leave the pool untouched.
    pub fn check_replace(&self, host_id: &Id, error: &anyhow::Error) -> anyhow::Result<bool> {
        let text = format!("{:#}", error);
        if !self.is_replacement_error(&text) {
            debug!("error from gateway {:?} does not trigger replacement: {}", host_id, text);
            return Ok(false);
        }

        warn!("replacing gateway {:?} after error: {}", host_id, text);
        self.replace_host(host_id)
    }

    /// Replaces a pool member with a fresh random gateway. Returns false if the host is not in the
    ///  pool (anymore).
    pub fn replace_host(&self, host_id: &Id) -> anyhow::Result<bool> {
        let filter = self.current_filter();
        {
            let mut state = self.state.write().unwrap();
            let index = match state.slot_index.get(host_id) {
                Some(&i) => i,
                None => return Ok(false),
            };

            let replacement = state.pick_replacement(filter.as_ref());
            if replacement.is_none() {
                bail!("no replacement available for gateway {:?}", host_id);
            }
            state.replace_slot(index, replacement);
        }

        self.save_host_list();
        Ok(true)
    }

    /// direct slot replacement, bypassing random selection
    pub fn replace_slot_with(&self, index: usize, gateway_id: &Id) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if index >= state.slots.len() {
                bail!("slot {} out of range for pool of size {}", index, state.slots.len());
            }
            if state.slot_index.contains_key(gateway_id) {
                bail!("gateway {:?} is in the pool already", gateway_id);
            }
            let host = match state.hosts.get(gateway_id) {
                Some(h) => h.clone(),
                None => bail!("gateway {:?} is not in the NDF", gateway_id),
            };
            state.replace_slot(index, Some(host));
        }
        self.save_host_list();
        Ok(())
    }

    /// Applies a new NDF: added gateways become available for the pool, removed gateways are
    ///  disconnected and their slots refilled. Returns the difference for further processing
    ///  (e.g. node key registration).
    pub fn update_ndf(&self, ndf: Ndf) -> NdfDiff {
        let filter = self.current_filter();
        let diff = {
            let mut state = self.state.write().unwrap();
            let diff = state.ndf.diff(&ndf);

            for gateway in &diff.added {
                debug!("gateway {:?} added to NDF", gateway.id);
                state.hosts.insert(gateway.id, Arc::new(Host::new(gateway)));
            }
            state.ndf = ndf;

            for id in &diff.removed {
                debug!("gateway {:?} removed from NDF", id);
                if let Some(&index) = state.slot_index.get(id) {
                    let replacement = state.pick_replacement(filter.as_ref());
                    state.replace_slot(index, replacement);
                }
                if let Some(host) = state.hosts.remove(id) {
                    host.disconnect();
                }
            }

            state.fill_empty_slots(filter.as_ref());
            diff
        };

        if !diff.is_empty() {
            info!("NDF update: {} gateways added, {} removed", diff.added.len(), diff.removed.len());
            self.save_host_list();
        }
        diff
    }

    fn save_host_list(&self) {
        let ids = self.host_ids();
        let mut buf = BytesMut::new();
        buf.put_usize_varint(ids.len());
        for id in &ids {
            id.ser(&mut buf);
        }
        if let Err(e) = self.store.set(HOST_LIST_KEY, VersionedObject::new(HOST_LIST_VERSION, buf.freeze())) {
            warn!("failed to persist host list: {}", e);
        }
    }

    fn load_host_list(store: &dyn KvStore) -> Vec<Id> {
        let decode = || -> anyhow::Result<Vec<Id>> {
            let obj = match store.get(HOST_LIST_KEY)? {
                Some(obj) => obj,
                None => return Ok(Vec::new()),
            };
            let mut buf = obj.expect_version(HOST_LIST_KEY, HOST_LIST_VERSION)?;
            let len = buf.try_get_usize_varint()?;
            let mut ids = Vec::new();
            for _ in 0..len {
                ids.push(Id::try_deser(&mut buf)?);
            }
            Ok(ids)
        };

        match decode() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("ignoring unreadable persisted host list: {}", e);
                Vec::new()
            }
        }
    }

    #[cfg(test)]
    fn slot(&self, index: usize) -> Option<Id> {
        self.state.read().unwrap().slots[index].as_ref().map(|h| h.id())
    }

    #[cfg(test)]
    fn slot_of(&self, id: &Id) -> Option<usize> {
        self.state.read().unwrap().slot_index.get(id).cloned()
    }
}
