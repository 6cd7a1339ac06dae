use bit_set::BitSet;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::primitives::round::RoundId;

/// Tracks which rounds were checked. Every round below `first_unchecked` counts as checked; above
///  it, individual rounds are tracked in a bitmap relative to `first_unchecked`.
///
/// Gateways use the same structure to announce which rounds they know to be finished.
#[derive(Debug, Clone)]
pub struct KnownRounds {
    first_unchecked: RoundId,
    last_checked: RoundId,
    bits: BitSet,
}

impl PartialEq for KnownRounds {
    fn eq(&self, other: &Self) -> bool {
        self.first_unchecked == other.first_unchecked
            && self.last_checked == other.last_checked
            && self.bits.iter().eq(other.bits.iter())
    }
}
impl Eq for KnownRounds {}

impl KnownRounds {
    pub fn new(first_unchecked: RoundId) -> KnownRounds {
        KnownRounds {
            first_unchecked,
            last_checked: first_unchecked.saturating_sub(1),
            bits: BitSet::new(),
        }
    }

    pub fn first_unchecked(&self) -> RoundId {
        self.first_unchecked
    }

    /// the highest round ever checked (or forwarded past)
    pub fn last_checked(&self) -> RoundId {
        self.last_checked
    }

    pub fn checked(&self, rid: RoundId) -> bool {
        if rid < self.first_unchecked {
            return true;
        }
        self.bits.contains((rid - self.first_unchecked) as usize)
    }

    pub fn check(&mut self, rid: RoundId) {
        if rid < self.first_unchecked {
            return;
        }
        self.bits.insert((rid - self.first_unchecked) as usize);
        self.last_checked = self.last_checked.max(rid);
        self.compact();
    }

    /// marks everything below `rid` as checked
    pub fn forward(&mut self, rid: RoundId) {
        if rid <= self.first_unchecked {
            return;
        }
        let shift = (rid - self.first_unchecked) as usize;
        self.bits = self.bits.iter()
            .filter(|&b| b >= shift)
            .map(|b| b - shift)
            .collect();
        self.first_unchecked = rid;
        self.last_checked = self.last_checked.max(rid - 1);
        self.compact();
    }

    fn compact(&mut self) {
        let mut prefix = 0usize;
        while self.bits.contains(prefix) {
            prefix += 1;
        }
        if prefix > 0 {
            self.forward(self.first_unchecked + prefix as RoundId);
        }
    }

    pub fn unchecked_in(&self, from: RoundId, to_inclusive: RoundId) -> Vec<RoundId> {
        (from.max(self.first_unchecked)..=to_inclusive)
            .filter(|&r| !self.checked(r))
            .collect()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.first_unchecked);
        buf.put_u64(self.last_checked);
        buf.put_usize_varint(self.bits.len());
        for b in self.bits.iter() {
            buf.put_usize_varint(b);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<KnownRounds> {
        let first_unchecked = buf.try_get_u64()?;
        let last_checked = buf.try_get_u64()?;
        let num_bits = buf.try_get_usize_varint()?;
        let mut bits = BitSet::new();
        for _ in 0..num_bits {
            bits.insert(buf.try_get_usize_varint()?);
        }
        Ok(KnownRounds {
            first_unchecked,
            last_checked,
            bits,
        })
    }
}
