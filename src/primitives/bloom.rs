use anyhow::bail;
use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};

use crate::primitives::round::RoundId;
use crate::util::buf::{put_bytes, try_get_bytes};

/// Plain bloom filter with double hashing over SHA-256. A filter never reports an added element
///  as absent; elements that were never added may test positive.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_hashes: u32,
}

impl BloomFilter {
    pub fn new(num_bytes: usize, num_hashes: u32) -> anyhow::Result<BloomFilter> {
        if num_bytes == 0 || num_hashes == 0 {
            bail!("a bloom filter needs at least one byte and one hash function");
        }
        Ok(BloomFilter {
            bits: vec![0u8; num_bytes],
            num_hashes,
        })
    }

    fn num_bits(&self) -> u64 {
        self.bits.len() as u64 * 8
    }

    fn positions(&self, element: &[u8]) -> impl Iterator<Item = usize> {
        let hash: [u8; 32] = Sha256::digest(element).into();
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&hash[..8]);
        h2.copy_from_slice(&hash[8..16]);
        let h1 = u64::from_be_bytes(h1);
        let h2 = u64::from_be_bytes(h2) | 1;
        let m = self.num_bits();

        (0..self.num_hashes as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    pub fn add(&mut self, element: &[u8]) {
        let positions = self.positions(element).collect::<Vec<_>>();
        for pos in positions {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    pub fn test(&self, element: &[u8]) -> bool {
        self.positions(element)
            .all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.num_hashes);
        put_bytes(buf, &self.bits);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<BloomFilter> {
        let num_hashes = buf.try_get_u32()?;
        let bits = try_get_bytes(buf)?;
        if bits.is_empty() || num_hashes == 0 {
            bail!("invalid bloom filter: {} bytes, {} hashes", bits.len(), num_hashes);
        }
        Ok(BloomFilter { bits, num_hashes })
    }
}

/// A gateway-published bloom filter over the rounds in `[first_round, first_round + round_range)`
///  that may contain messages for one ephemeral ID.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RemoteFilter {
    pub first_round: RoundId,
    pub round_range: u32,
    pub filter: BloomFilter,
}

impl RemoteFilter {
    pub fn round_element(rid: RoundId) -> [u8; 8] {
        rid.to_be_bytes()
    }

    pub fn last_round(&self) -> RoundId {
        self.first_round + (self.round_range as RoundId).saturating_sub(1)
    }

    pub fn covers(&self, rid: RoundId) -> bool {
        self.round_range > 0 && rid >= self.first_round && rid <= self.last_round()
    }

    /// true if this filter covers the round and its bloom filter tests positive for it
    pub fn may_contain(&self, rid: RoundId) -> bool {
        self.covers(rid) && self.filter.test(&Self::round_element(rid))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.first_round);
        buf.put_u32(self.round_range);
        self.filter.ser(buf);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RemoteFilter> {
        Ok(RemoteFilter {
            first_round: buf.try_get_u64()?,
            round_range: buf.try_get_u32()?,
            filter: BloomFilter::try_deser(buf)?,
        })
    }
}
