use std::fmt::{Debug, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::primitives::id::Id;

/// ephemeral IDs rotate once per period; the phase within the period is derived from the ID
pub const EPHEMERAL_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

pub const MAX_ADDRESS_SPACE_SIZE: u8 = 64;

/// A short-lived reception address derived from a recipient ID. Only the low
///  `address_space_size` bits identify the recipient; the address space is intentionally small so
///  that many recipients collide and gateways cannot tell them apart.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct EphemeralId(pub [u8; 8]);

impl Debug for EphemeralId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EphId({:016x})", self.as_u64())
    }
}

/// an ephemeral ID together with the validity window it was derived for
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EphemeralWindow {
    pub id: EphemeralId,
    pub start: SystemTime,
    pub end: SystemTime,
}

impl EphemeralId {
    pub fn from_u64(value: u64) -> EphemeralId {
        EphemeralId(value.to_be_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Derives the ephemeral ID of `id` for the period containing `timestamp`, reduced to
    ///  `address_space_size` bits.
    pub fn derive(id: &Id, address_space_size: u8, timestamp: SystemTime) -> anyhow::Result<EphemeralWindow> {
        if address_space_size > MAX_ADDRESS_SPACE_SIZE {
            bail!("address space size {} exceeds the maximum of {}", address_space_size, MAX_ADDRESS_SPACE_SIZE);
        }

        let period = EPHEMERAL_PERIOD.as_nanos() as u64;
        let now = match timestamp.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as u64,
            Err(_) => bail!("timestamp {:?} is before the epoch", timestamp),
        };

        let offset = Self::period_offset(id, period);
        let shifted = now + (period - offset);
        let epoch = shifted / period;

        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        hasher.update(epoch.to_be_bytes());
        hasher.update([address_space_size]);
        let hash: [u8; 32] = hasher.finalize().into();

        let mut raw = [0u8; 8];
        raw.copy_from_slice(&hash[..8]);
        let eph = EphemeralId(raw).clear_high_bits(address_space_size);

        let start_nanos = (epoch * period).saturating_sub(period - offset);
        Ok(EphemeralWindow {
            id: eph,
            start: UNIX_EPOCH + Duration::from_nanos(start_nanos),
            end: UNIX_EPOCH + Duration::from_nanos(start_nanos + period),
        })
    }

    fn period_offset(id: &Id, period: u64) -> u64 {
        let hash: [u8; 32] = Sha256::digest(id.as_bytes()).into();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&hash[..8]);
        u64::from_be_bytes(raw) % period
    }

    fn low_bits_mask(address_space_size: u8) -> u64 {
        match address_space_size {
            0 => 0,
            s if s >= 64 => u64::MAX,
            s => (1u64 << s) - 1,
        }
    }

    /// zeroes the bits above the address space, the canonical form for comparisons
    pub fn clear_high_bits(&self, address_space_size: u8) -> EphemeralId {
        EphemeralId::from_u64(self.as_u64() & Self::low_bits_mask(address_space_size))
    }

    /// Replaces the bits above the address space with random data. Gateways only look at the low
    ///  bits, so this hides the address space size from observers of the wire format.
    pub fn fill_random_high_bits(&self, address_space_size: u8, rng: &mut impl RngCore) -> EphemeralId {
        let mask = Self::low_bits_mask(address_space_size);
        EphemeralId::from_u64((self.as_u64() & mask) | (rng.next_u64() & !mask))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::primitives::id::IdType;
    use super::*;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(16)]
    #[case(63)]
    #[case(64)]
    fn test_derive_fits_address_space(#[case] size: u8) {
        let id = Id::from_seed(b"recipient", IdType::User);
        let window = EphemeralId::derive(&id, size, SystemTime::now()).unwrap();
        assert_eq!(window.id.clear_high_bits(size), window.id);
        assert!(window.start <= SystemTime::now());
        assert!(window.end > SystemTime::now());
        assert_eq!(window.end.duration_since(window.start).unwrap(), EPHEMERAL_PERIOD);
    }

    #[test]
    fn test_derive_too_big() {
        let id = Id::from_seed(b"recipient", IdType::User);
        assert!(EphemeralId::derive(&id, 65, SystemTime::now()).is_err());
    }

    #[test]
    fn test_derive_stable_within_window() {
        let id = Id::from_seed(b"recipient", IdType::User);
        let window = EphemeralId::derive(&id, 16, SystemTime::now()).unwrap();

        let again = EphemeralId::derive(&id, 16, window.start + Duration::from_secs(1)).unwrap();
        assert_eq!(again, window);

        let next = EphemeralId::derive(&id, 16, window.end + Duration::from_secs(1)).unwrap();
        assert_eq!(next.start, window.end);
    }

    #[test]
    fn test_fill_random_high_bits() {
        let id = Id::from_seed(b"recipient", IdType::User);
        let window = EphemeralId::derive(&id, 8, SystemTime::now()).unwrap();

        let mut rng = rand::rng();
        let filled = window.id.fill_random_high_bits(8, &mut rng);
        assert_eq!(filled.clear_high_bits(8), window.id);
    }
}
