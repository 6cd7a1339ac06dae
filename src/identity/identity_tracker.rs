use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tracing::{debug, error, info, warn};

use crate::primitives::ephemeral::{EphemeralId, EphemeralWindow};
use crate::primitives::id::Id;
use crate::primitives::known_rounds::KnownRounds;
use crate::primitives::round::{to_nanos, RoundId};
use crate::storage::kv::{KvStore, VersionedObject};
use crate::util::buf::try_get_array;

pub const IDENTITIES_KEY: &str = "identities/tracked";
const IDENTITIES_VERSION: u64 = 0;

/// An identity messages are picked up for, with the ephemeral ID currently derived from it
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceptionIdentity {
    pub source: Id,
    pub address_space_size: u8,
    pub ephemeral: EphemeralWindow,
}

impl ReceptionIdentity {
    pub fn ephemeral_id(&self) -> EphemeralId {
        self.ephemeral.id
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.source.ser(buf);
        buf.put_u8(self.address_space_size);
        buf.put_slice(&self.ephemeral.id.0);
        buf.put_u64(to_nanos(self.ephemeral.start));
        buf.put_u64(to_nanos(self.ephemeral.end));
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ReceptionIdentity> {
        let source = Id::try_deser(buf)?;
        let address_space_size = buf.try_get_u8()?;
        let id = EphemeralId(try_get_array(buf)?);
        let start = UNIX_EPOCH + Duration::from_nanos(buf.try_get_u64()?);
        let end = UNIX_EPOCH + Duration::from_nanos(buf.try_get_u64()?);
        Ok(ReceptionIdentity {
            source,
            address_space_size,
            ephemeral: EphemeralWindow { id, start, end },
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct TrackedIdentity {
    address_space_size: u8,
    /// rounds that were checked for this identity; everything below the watermark is resolved
    checked: KnownRounds,
}

impl TrackedIdentity {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.address_space_size);
        self.checked.ser(buf);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TrackedIdentity> {
        let address_space_size = buf.try_get_u8()?;
        let checked = KnownRounds::try_deser(buf)?;
        Ok(TrackedIdentity { address_space_size, checked })
    }
}

/// The reception identities of this client and, per identity, which rounds were checked for
///  messages already. The checkpoints are persisted on every change so that no round is checked
///  twice across restarts, and none is skipped.
pub struct IdentityTracker {
    store: Arc<dyn KvStore>,
    identities: Mutex<BTreeMap<Id, TrackedIdentity>>,
}

impl IdentityTracker {
    pub fn new(store: Arc<dyn KvStore>) -> IdentityTracker {
        let identities = Self::load(store.as_ref());
        IdentityTracker {
            store,
            identities: Mutex::new(identities),
        }
    }

    /// Starts tracking an identity, checking rounds from `first_round` on. Adding an identity
    ///  that is tracked already leaves its checkpoint untouched.
    pub fn add_identity(&self, source: Id, address_space_size: u8, first_round: RoundId) -> bool {
        {
            let mut identities = self.identities.lock().unwrap();
            if identities.contains_key(&source) {
                debug!("identity {:?} is tracked already", source);
                return false;
            }
            identities.insert(source, TrackedIdentity {
                address_space_size,
                checked: KnownRounds::new(first_round),
            });
        }
        info!("tracking identity {:?} from round {}", source, first_round);
        self.save();
        true
    }

    pub fn remove_identity(&self, source: &Id) -> bool {
        let removed = self.identities.lock().unwrap().remove(source).is_some();
        if removed {
            info!("stopped tracking identity {:?}", source);
            self.save();
        }
        removed
    }

    pub fn is_tracked(&self, source: &Id) -> bool {
        self.identities.lock().unwrap().contains_key(source)
    }

    /// all tracked identities with their ephemeral IDs valid at `now`
    pub fn identities(&self, now: SystemTime) -> Vec<ReceptionIdentity> {
        self.identities.lock().unwrap()
            .iter()
            .filter_map(|(source, tracked)| {
                match EphemeralId::derive(source, tracked.address_space_size, now) {
                    Ok(ephemeral) => Some(ReceptionIdentity {
                        source: *source,
                        address_space_size: tracked.address_space_size,
                        ephemeral,
                    }),
                    Err(e) => {
                        error!("cannot derive ephemeral ID for {:?}: {}", source, e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn is_checked(&self, source: &Id, round_id: RoundId) -> bool {
        self.identities.lock().unwrap()
            .get(source)
            .map(|t| t.checked.checked(round_id))
            .unwrap_or(true)
    }

    pub fn check(&self, source: &Id, round_id: RoundId) {
        let changed = match self.identities.lock().unwrap().get_mut(source) {
            Some(tracked) => {
                tracked.checked.check(round_id);
                true
            }
            None => false,
        };
        if changed {
            self.save();
        }
        else {
            warn!("round {} checked for untracked identity {:?}", round_id, source);
        }
    }

    /// the first round not yet checked for an identity
    pub fn watermark(&self, source: &Id) -> Option<RoundId> {
        self.identities.lock().unwrap()
            .get(source)
            .map(|t| t.checked.first_unchecked())
    }

    /// marks all rounds below `round_id` as resolved for an identity
    pub fn forward(&self, source: &Id, round_id: RoundId) {
        let changed = match self.identities.lock().unwrap().get_mut(source) {
            Some(tracked) if tracked.checked.first_unchecked() < round_id => {
                tracked.checked.forward(round_id);
                true
            }
            _ => false,
        };
        if changed {
            debug!("identity {:?} forwarded to round {}", source, round_id);
            self.save();
        }
    }

    /// the rounds in `from..=to` not checked yet for an identity, at most `max` of them
    pub fn unchecked(&self, source: &Id, to_inclusive: RoundId, max: usize) -> Vec<RoundId> {
        match self.identities.lock().unwrap().get(source) {
            Some(tracked) => {
                let from = tracked.checked.first_unchecked();
                let to = to_inclusive.min(from.saturating_add(max as RoundId).saturating_sub(1));
                if max == 0 || to < from {
                    return Vec::new();
                }
                tracked.checked.unchecked_in(from, to)
            }
            None => Vec::new(),
        }
    }

    fn save(&self) {
        let mut buf = BytesMut::new();
        {
            let identities = self.identities.lock().unwrap();
            buf.put_usize_varint(identities.len());
            for (source, tracked) in identities.iter() {
                source.ser(&mut buf);
                tracked.ser(&mut buf);
            }
        }
        if let Err(e) = self.store.set(IDENTITIES_KEY, VersionedObject::new(IDENTITIES_VERSION, buf.freeze())) {
            error!("failed to persist tracked identities: {}", e);
        }
    }

    fn load(store: &dyn KvStore) -> BTreeMap<Id, TrackedIdentity> {
        let decode = || -> anyhow::Result<BTreeMap<Id, TrackedIdentity>> {
            let obj = match store.get(IDENTITIES_KEY)? {
                Some(obj) => obj,
                None => return Ok(BTreeMap::new()),
            };
            let mut buf = obj.expect_version(IDENTITIES_KEY, IDENTITIES_VERSION)?;
            let len = buf.try_get_usize_varint()?;
            let mut result = BTreeMap::new();
            for _ in 0..len {
                let source = Id::try_deser(&mut buf)?;
                result.insert(source, TrackedIdentity::try_deser(&mut buf)?);
            }
            Ok(result)
        };

        match decode() {
            Ok(identities) => identities,
            Err(e) => {
                error!("could not load tracked identities: {}", e);
                BTreeMap::new()
            }
        }
    }
}
