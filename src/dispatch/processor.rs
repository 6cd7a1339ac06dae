use crate::identity::identity_tracker::ReceptionIdentity;
use crate::primitives::message::CmixMessage;
use crate::primitives::round::RoundInfo;

/// Receives messages matched by fingerprint or service. A processor that consumes a fingerprint
///  must persist that fact before returning, so that a message delivered again after a restart
///  is not processed twice.
#[cfg_attr(test, mockall::automock)]
pub trait MessageProcessor: Send + Sync + 'static {
    fn process(&self, message: &CmixMessage, identity: &ReceptionIdentity, round: &RoundInfo);
}
