use std::time::Duration;

use rustc_hash::FxHashSet;

use crate::primitives::ephemeral::EphemeralId;
use crate::primitives::fingerprint::Fingerprint;
use crate::primitives::id::Id;
use crate::primitives::message::MAC_LEN;
use crate::primitives::round::RoundId;
use crate::primitives::service::Service;

/// Parameters for a single send call
#[derive(Debug, Clone)]
pub struct CmixParams {
    /// number of rounds to try before giving up
    pub round_tries: u32,
    /// overall time limit for the send call
    pub timeout: Duration,
    /// upper limit for a single attempt to put a message into a round
    pub send_timeout: Duration,
    /// shows up in log output
    pub debug_tag: String,
    /// rounds containing one of these nodes are skipped
    pub blacklisted_nodes: FxHashSet<Id>,
    /// persist the message and resend it until it is delivered
    pub critical: bool,
}

impl Default for CmixParams {
    fn default() -> Self {
        CmixParams {
            round_tries: 10,
            timeout: Duration::from_secs(45),
            send_timeout: Duration::from_secs(3),
            debug_tag: "External".to_string(),
            blacklisted_nodes: Default::default(),
            critical: false,
        }
    }
}

/// A message with everything needed to address it: the recipient determines the ephemeral ID,
///  the fingerprint and the service allow the recipient to identify it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TargetedMessage {
    pub recipient: Id,
    pub fingerprint: Fingerprint,
    pub service: Service,
    pub contents: Vec<u8>,
    pub mac: [u8; MAC_LEN],
}

/// the round a message was sent in, and the ephemeral IDs of the recipients in that round
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SendReport {
    pub round_id: RoundId,
    pub ephemeral_ids: Vec<EphemeralId>,
}
