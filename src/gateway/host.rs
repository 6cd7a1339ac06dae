use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::primitives::id::Id;
use crate::primitives::ndf::GatewayInfo;

/// A gateway the client may talk to. The actual transport connection is owned by the
///  [crate::gateway::comms::GatewayComms] implementation; this keeps the bookkeeping the pool needs.
pub struct Host {
    id: Id,
    address: String,
    certificate: String,
    connected: AtomicBool,
    send_errors: AtomicU32,
}

impl Debug for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Host({:?}@{})", self.id, self.address)
    }
}

impl Host {
    pub fn new(info: &GatewayInfo) -> Host {
        Host {
            id: info.id,
            address: info.address.clone(),
            certificate: info.tls_certificate.clone(),
            connected: AtomicBool::new(false),
            send_errors: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn record_send_error(&self) -> u32 {
        self.send_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn send_errors(&self) -> u32 {
        self.send_errors.load(Ordering::Acquire)
    }
}
