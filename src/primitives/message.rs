use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;

use crate::primitives::ephemeral::EphemeralId;
use crate::primitives::fingerprint::{Fingerprint, IDENTITY_FP_LEN};
use crate::util::buf::{put_bytes, try_get_array, try_get_bytes};

pub const MAC_LEN: usize = 32;

/// A message as it travels through the mix network. The key fingerprint and the identity
///  fingerprint start with a bit that is zero by construction; the sender sets it randomly before
///  encryption and the receiver ignores it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CmixMessage {
    pub key_fp: Fingerprint,
    pub mac: [u8; MAC_LEN],
    pub ephemeral_rid: EphemeralId,
    pub sih: [u8; IDENTITY_FP_LEN],
    pub contents: Vec<u8>,
}

impl CmixMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.key_fp.ser(buf);
        buf.put_slice(&self.mac);
        buf.put_slice(&self.ephemeral_rid.0);
        buf.put_slice(&self.sih);
        put_bytes(buf, &self.contents);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.to_vec()
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CmixMessage> {
        let key_fp = Fingerprint::try_deser(buf)?;
        let mac = try_get_array(buf)?;
        let ephemeral_rid = EphemeralId(try_get_array(buf)?);
        let mut sih: [u8; IDENTITY_FP_LEN] = try_get_array(buf)?;
        sih[0] &= 0x7f;
        let contents = try_get_bytes(buf)?;

        Ok(CmixMessage {
            key_fp,
            mac,
            ephemeral_rid,
            sih,
            contents,
        })
    }

    pub fn from_bytes(mut raw: &[u8]) -> anyhow::Result<CmixMessage> {
        Self::try_deser(&mut raw)
    }
}

/// offset of the identity fingerprint inside a serialized [CmixMessage]
const SIH_OFFSET: usize = 32 + MAC_LEN + 8;

/// Randomizes the leading bits of both fingerprints in a serialized message. Without this, a
///  malicious node could tag a message by flipping those bits and observe where it goes.
pub fn set_group_bits(serialized: &mut [u8], rng: &mut impl RngCore) {
    let random = rng.next_u32();
    if !serialized.is_empty() {
        serialized[0] = (serialized[0] & 0x7f) | ((random as u8) & 0x80);
    }
    if serialized.len() > SIH_OFFSET {
        serialized[SIH_OFFSET] = (serialized[SIH_OFFSET] & 0x7f) | (((random >> 8) as u8) & 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_message() -> CmixMessage {
        CmixMessage {
            key_fp: Fingerprint::from_seed(b"fp"),
            mac: [9u8; MAC_LEN],
            ephemeral_rid: EphemeralId::from_u64(12345),
            sih: [5u8; IDENTITY_FP_LEN],
            contents: b"some contents".to_vec(),
        }
    }

    #[test]
    fn test_ser_deser() {
        let msg = test_message();
        assert_eq!(CmixMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_group_bits_are_ignored_on_receipt() {
        let msg = test_message();
        let mut raw = msg.to_bytes();
        raw[0] |= 0x80;
        raw[SIH_OFFSET] |= 0x80;

        assert_eq!(CmixMessage::from_bytes(&raw).unwrap(), msg);

        let mut rng = rand::rng();
        for _ in 0..20 {
            let mut raw = msg.to_bytes();
            set_group_bits(&mut raw, &mut rng);
            assert_eq!(CmixMessage::from_bytes(&raw).unwrap(), msg);
        }
    }

    #[test]
    fn test_truncated() {
        let raw = test_message().to_bytes();
        assert!(CmixMessage::from_bytes(&raw[..40]).is_err());
    }
}
