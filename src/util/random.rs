use rand::RngCore;

/// Draws a uniformly distributed number from `[start, end)` using rejection sampling: values at
///  or above the largest multiple of the range size that fits into a u32 are discarded and
///  drawn again, which avoids the modulo bias of a plain `next_u32() % size`.
///
/// Callers pass a cryptographically secure rng (e.g. [rand::rng]) wherever the selection must
///  not be predictable by a network observer.
pub fn read_range_u32(start: u32, end: u32, rng: &mut impl RngCore) -> u32 {
    assert!(end > start, "empty range {}..{}", start, end);

    let size = (end - start) as u64;
    let limit = (1u64 << 32) / size * size;

    loop {
        let candidate = rng.next_u32() as u64;
        if candidate < limit {
            return start + (candidate % size) as u32;
        }
    }
}

/// Picks a random index into a collection of length `len`, see [read_range_u32]
pub fn random_index(len: usize, rng: &mut impl RngCore) -> usize {
    read_range_u32(0, len as u32, rng) as usize
}
