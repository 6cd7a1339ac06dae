use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};

use crate::util::buf::try_get_array;

pub const FINGERPRINT_LEN: usize = 32;
pub const IDENTITY_FP_LEN: usize = 25;

/// A one-time key fingerprint: 255 bits of identifying data, the top bit is always zero so that the
///  value fits below the cyclic group's prime when embedded in a payload.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn new(mut raw: [u8; FINGERPRINT_LEN]) -> Fingerprint {
        raw[0] &= 0x7f;
        Fingerprint(raw)
    }

    pub fn from_seed(seed: &[u8]) -> Fingerprint {
        Fingerprint::new(Sha256::digest(seed).into())
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Fingerprint> {
        Ok(Fingerprint::new(try_get_array(buf)?))
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fp(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Message identity fingerprint: binds a message's contents to a recipient-derived preimage so
///  that a receiver can trial-hash its known preimages against incoming messages.
pub fn identity_fingerprint(contents: &[u8], preimage: &[u8; 32]) -> [u8; IDENTITY_FP_LEN] {
    let contents_hash = Sha256::digest(contents);

    let mut hasher = Sha256::new();
    hasher.update(contents_hash);
    hasher.update(preimage);
    let full: [u8; 32] = hasher.finalize().into();

    let mut result = [0u8; IDENTITY_FP_LEN];
    result.copy_from_slice(&full[..IDENTITY_FP_LEN]);
    // same reasoning as for key fingerprints: the value is embedded at the start of a payload
    result[0] &= 0x7f;
    result
}

pub fn check_identity_fingerprint(fp: &[u8; IDENTITY_FP_LEN], contents: &[u8], preimage: &[u8; 32]) -> bool {
    &identity_fingerprint(contents, preimage) == fp
}
