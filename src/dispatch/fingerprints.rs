use std::sync::{Arc, Mutex};

use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace};

use crate::dispatch::processor::MessageProcessor;
use crate::primitives::fingerprint::Fingerprint;
use crate::primitives::id::Id;

/// One-time fingerprints per reception identity. A fingerprint is removed when it is matched, so
///  it can never match a second message.
#[derive(Default)]
pub struct FingerprintsMap {
    fingerprints: Mutex<FxHashMap<Id, FxHashMap<Fingerprint, Arc<dyn MessageProcessor>>>>,
}

impl FingerprintsMap {
    pub fn new() -> FingerprintsMap {
        Default::default()
    }

    /// Registering a fingerprint twice is a bug in the caller and fails.
    pub fn add(&self, client_id: Id, fingerprint: Fingerprint, processor: Arc<dyn MessageProcessor>) -> anyhow::Result<()> {
        let mut fingerprints = self.fingerprints.lock().unwrap();
        let for_client = fingerprints.entry(client_id).or_default();
        if for_client.contains_key(&fingerprint) {
            error!("fingerprint {:?} is registered for {:?} already", fingerprint, client_id);
            bail!("fingerprint {:?} is registered for {:?} already", fingerprint, client_id);
        }
        trace!("added fingerprint {:?} for {:?}", fingerprint, client_id);
        for_client.insert(fingerprint, processor);
        Ok(())
    }

    /// Removes the fingerprint and returns its processor, atomically
    pub fn pop(&self, client_id: &Id, fingerprint: &Fingerprint) -> Option<Arc<dyn MessageProcessor>> {
        let mut fingerprints = self.fingerprints.lock().unwrap();
        let for_client = fingerprints.get_mut(client_id)?;
        let result = for_client.remove(fingerprint);
        if for_client.is_empty() {
            fingerprints.remove(client_id);
        }
        result
    }

    pub fn delete(&self, client_id: &Id, fingerprint: &Fingerprint) {
        if self.pop(client_id, fingerprint).is_some() {
            trace!("deleted fingerprint {:?} for {:?}", fingerprint, client_id);
        }
    }

    pub fn delete_client(&self, client_id: &Id) {
        if let Some(removed) = self.fingerprints.lock().unwrap().remove(client_id) {
            debug!("deleted {} fingerprints for {:?}", removed.len(), client_id);
        }
    }

    pub fn len(&self, client_id: &Id) -> usize {
        self.fingerprints.lock().unwrap()
            .get(client_id)
            .map(|f| f.len())
            .unwrap_or(0)
    }
}
