use std::time::{Duration, SystemTime};

use crate::primitives::round::{to_nanos, RoundId, RoundInfo, RoundState, NUM_ROUND_STATES};
use crate::test_util::ndf::test_node_id;

/// A round whose topology consists of nodes `1..=num_nodes` (see [test_node_id]), with
///  timestamps for all states up to and including `state`
pub fn test_round(id: RoundId, state: RoundState, num_nodes: u16) -> RoundInfo {
    let mut timestamps = [0u64; NUM_ROUND_STATES];
    let base = SystemTime::now();
    for s in 0..=u8::from(state) {
        timestamps[s as usize] = to_nanos(base + Duration::from_secs(s as u64));
    }

    RoundInfo {
        id,
        update_id: id,
        state,
        topology: (1..=num_nodes).map(test_node_id).collect(),
        timestamps,
        address_space_size: 16,
        batch_size: 32,
        errors: Vec::new(),
    }
}

/// a queued round with realtime scheduled `realtime_in` from now
pub fn test_queued_round(id: RoundId, num_nodes: u16, realtime_in: Duration) -> RoundInfo {
    let mut round = test_round(id, RoundState::Queued, num_nodes);
    round.timestamps[u8::from(RoundState::Queued) as usize] = to_nanos(SystemTime::now() + realtime_in);
    round
}
