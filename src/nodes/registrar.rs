use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use bytes::BytesMut;
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::crypto::{MixCrypto, NodeKey};
use crate::gateway::comms::{ClientKeyRequest, GatewayComms};
use crate::gateway::sender::Sender;
use crate::primitives::id::Id;
use crate::primitives::round::to_nanos;
use crate::storage::kv::{KvStore, VersionedObject};
use crate::util::buf::{put_bytes, try_get_array, try_get_bytes};
use crate::util::stoppable::StopSignal;

pub const NODE_KEYS_KEY: &str = "registrar/nodeKeys";
const NODE_KEYS_VERSION: u64 = 0;

/// The key a node shares with this client, used to encrypt a message's layer for that node
#[derive(Clone, Eq, PartialEq)]
pub struct MixKey {
    pub key: NodeKey,
    pub key_id: Vec<u8>,
    /// nanos since epoch
    pub valid_until: u64,
}

impl std::fmt::Debug for MixKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MixKey(id={:02x?}, valid_until={})", self.key_id, self.valid_until)
    }
}

impl MixKey {
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        self.valid_until > to_nanos(now)
    }
}

/// Keeps the keys shared with nodes and registers with nodes for which there is no key yet.
///  Registration requests are queued and handled by a small worker pool, a node being queued at
///  most once at any time.
pub struct Registrar {
    client_id: Id,
    crypto: Arc<dyn MixCrypto>,
    store: Arc<dyn KvStore>,
    keys: RwLock<FxHashMap<Id, MixKey>>,
    pending: Mutex<FxHashSet<Id>>,
    trigger: mpsc::Sender<Id>,
}

impl Registrar {
    pub fn new(client_id: Id, crypto: Arc<dyn MixCrypto>, store: Arc<dyn KvStore>, queue_capacity: usize) -> (Registrar, mpsc::Receiver<Id>) {
        let (trigger, receiver) = mpsc::channel(queue_capacity);
        let keys = Self::load_keys(store.as_ref());
        debug!("registrar loaded {} node keys", keys.len());

        let registrar = Registrar {
            client_id,
            crypto,
            store,
            keys: RwLock::new(keys),
            pending: Default::default(),
            trigger,
        };
        (registrar, receiver)
    }

    pub fn has_node(&self, node_id: &Id) -> bool {
        self.keys.read().unwrap()
            .get(node_id)
            .map(|k| k.is_valid_at(SystemTime::now()))
            .unwrap_or(false)
    }

    pub fn num_keys(&self) -> usize {
        self.keys.read().unwrap().len()
    }

    /// The keys for all nodes in `topology` (in topology order), or the nodes for which there is
    ///  no valid key.
    pub fn get_keys(&self, topology: &[Id]) -> Result<Vec<MixKey>, Vec<Id>> {
        let now = SystemTime::now();
        let keys = self.keys.read().unwrap();

        let mut result = Vec::with_capacity(topology.len());
        let mut missing = Vec::new();
        for node_id in topology {
            match keys.get(node_id) {
                Some(key) if key.is_valid_at(now) => result.push(key.clone()),
                _ => missing.push(*node_id),
            }
        }

        if missing.is_empty() {
            Ok(result)
        }
        else {
            Err(missing)
        }
    }

    /// Queues registration with a node unless there is a key for it already or it is queued
    ///  already. This never blocks: if the queue is full, the request is dropped and will be
    ///  triggered again by the next send attempt needing the node.
    pub fn trigger_registration(&self, node_id: &Id) {
        if self.has_node(node_id) {
            return;
        }

        let mut pending = self.pending.lock().unwrap();
        if !pending.insert(*node_id) {
            trace!("registration with {:?} is pending already", node_id);
            return;
        }

        match self.trigger.try_send(*node_id) {
            Ok(()) => debug!("queued registration with node {:?}", node_id),
            Err(e) => {
                pending.remove(node_id);
                debug!("could not queue registration with {:?}: {}", node_id, e);
            }
        }
    }

    pub fn is_pending(&self, node_id: &Id) -> bool {
        self.pending.lock().unwrap().contains(node_id)
    }

    pub fn add_key(&self, node_id: Id, key: MixKey) {
        self.keys.write().unwrap().insert(node_id, key);
        self.save_keys();
    }

    /// Drops the key for a node, e.g. because the node no longer accepts it
    pub fn remove_node(&self, node_id: &Id) {
        if self.keys.write().unwrap().remove(node_id).is_some() {
            info!("removed key for node {:?}", node_id);
            self.save_keys();
        }
    }

    /// requests key material from a node's gateway and stores the derived key
    #[instrument(level = "debug", skip(self, sender, comms))]
    pub async fn register(&self, node_id: Id, sender: &Sender, comms: &Arc<dyn GatewayComms>) -> anyhow::Result<()> {
        let gateway_id = node_id.to_gateway_id();
        let request = ClientKeyRequest {
            client_id: self.client_id,
            node_id,
            client_public_key: self.crypto.client_public_key(),
            timestamp: to_nanos(SystemTime::now()),
            target: gateway_id,
        };

        let response = sender.send_to_specific(&gateway_id, |host, target| {
            let comms = comms.clone();
            let request = ClientKeyRequest { target, ..request.clone() };
            async move { comms.request_client_key(&host, &request).await }
        }).await?;

        let key = MixKey {
            key: self.crypto.derive_node_key(&node_id, &response.node_key_material),
            key_id: response.key_id,
            valid_until: response.valid_until,
        };
        info!("registered with node {:?}", node_id);
        self.add_key(node_id, key);
        Ok(())
    }

    /// One registration worker. Several of them share the receiver, each handling one node at a time.
    pub async fn run_registration_worker(
        self: Arc<Self>,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Id>>>,
        sender: Arc<Sender>,
        comms: Arc<dyn GatewayComms>,
        stop: StopSignal,
    ) {
        loop {
            let node_id = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    node_id = receiver.recv() => node_id,
                    _ = stop.stopped() => None,
                }
            };
            let node_id = match node_id {
                Some(id) => id,
                None => break,
            };

            if let Err(e) = self.register(node_id, &sender, &comms).await {
                warn!("registration with node {:?} failed: {:#}", node_id, e);
            }
            self.pending.lock().unwrap().remove(&node_id);
        }
        debug!("registration worker stopped");
    }

    fn save_keys(&self) {
        let mut buf = BytesMut::new();
        {
            let keys = self.keys.read().unwrap();
            buf.put_usize_varint(keys.len());
            for (node_id, key) in keys.iter() {
                node_id.ser(&mut buf);
                buf.extend_from_slice(&key.key);
                put_bytes(&mut buf, &key.key_id);
                buf.put_u64_varint(key.valid_until);
            }
        }
        if let Err(e) = self.store.set(NODE_KEYS_KEY, VersionedObject::new(NODE_KEYS_VERSION, buf.freeze())) {
            error!("failed to persist node keys: {}", e);
        }
    }

    fn load_keys(store: &dyn KvStore) -> FxHashMap<Id, MixKey> {
        let decode = || -> anyhow::Result<FxHashMap<Id, MixKey>> {
            let obj = match store.get(NODE_KEYS_KEY)? {
                Some(obj) => obj,
                None => return Ok(Default::default()),
            };
            let mut buf = obj.expect_version(NODE_KEYS_KEY, NODE_KEYS_VERSION)?;
            let len = buf.try_get_usize_varint()?;
            let mut keys = FxHashMap::default();
            for _ in 0..len {
                let node_id = Id::try_deser(&mut buf)?;
                let key = try_get_array(&mut buf)?;
                let key_id = try_get_bytes(&mut buf)?;
                let valid_until = buf.try_get_u64_varint()?;
                keys.insert(node_id, MixKey { key, key_id, valid_until });
            }
            Ok(keys)
        };

        match decode() {
            Ok(keys) => keys,
            Err(e) => {
                error!("could not load node keys, registering again: {}", e);
                Default::default()
            }
        }
    }
}
