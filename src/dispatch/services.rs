use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::dispatch::processor::MessageProcessor;
use crate::primitives::fingerprint::{check_identity_fingerprint, IDENTITY_FP_LEN};
use crate::primitives::id::Id;
use crate::primitives::service::Service;

struct ServiceEntry {
    service: Service,
    processors: Vec<Arc<dyn MessageProcessor>>,
}

/// Services per reception identity. A message matches a service if its identity fingerprint was
///  computed over the service's preimage, which can only be found out by trying every service.
#[derive(Default)]
pub struct ServicesMap {
    services: RwLock<FxHashMap<Id, Vec<ServiceEntry>>>,
}

impl ServicesMap {
    pub fn new() -> ServicesMap {
        Default::default()
    }

    /// Adds a processor for a service. Several processors can share a service, and all of them
    ///  receive each matching message.
    pub fn add(&self, client_id: Id, service: Service, processor: Arc<dyn MessageProcessor>) {
        let mut services = self.services.write().unwrap();
        let for_client = services.entry(client_id).or_default();
        match for_client.iter_mut().find(|e| e.service == service) {
            Some(entry) => entry.processors.push(processor),
            None => {
                debug!("added service {:?} for {:?}", service.tag, client_id);
                // compute and cache the preimage outside the message path
                let _ = service.preimage();
                for_client.push(ServiceEntry { service, processors: vec![processor] });
            }
        }
    }

    /// removes a service with all its processors
    pub fn delete(&self, client_id: &Id, service: &Service) -> bool {
        let mut services = self.services.write().unwrap();
        let for_client = match services.get_mut(client_id) {
            Some(s) => s,
            None => return false,
        };
        let len_before = for_client.len();
        for_client.retain(|e| &e.service != service);
        let removed = for_client.len() != len_before;
        if for_client.is_empty() {
            services.remove(client_id);
        }
        if removed {
            debug!("deleted service {:?} for {:?}", service.tag, client_id);
        }
        removed
    }

    pub fn delete_client(&self, client_id: &Id) {
        self.services.write().unwrap().remove(client_id);
    }

    /// all processors of the services matching the message's identity fingerprint
    pub fn get(&self, client_id: &Id, sih: &[u8; IDENTITY_FP_LEN], contents: &[u8]) -> Vec<Arc<dyn MessageProcessor>> {
        let services = self.services.read().unwrap();
        let for_client = match services.get(client_id) {
            Some(s) => s,
            None => return Vec::new(),
        };

        let mut result = Vec::new();
        for entry in for_client {
            if check_identity_fingerprint(sih, contents, entry.service.preimage()) {
                trace!("message matches service {:?}", entry.service.tag);
                result.extend(entry.processors.iter().cloned());
            }
        }
        result
    }

    pub fn num_services(&self, client_id: &Id) -> usize {
        self.services.read().unwrap()
            .get(client_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}
