use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::primitives::id::Id;
use crate::util::buf::{put_string, try_get_string};

pub type RoundId = u64;

pub const NUM_ROUND_STATES: usize = 7;

/// Lifecycle of a round. Rounds move forward through these states; `Completed` and `Failed` are
///  terminal.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum RoundState {
    Pending = 0,
    Precomputing = 1,
    Standby = 2,
    Queued = 3,
    Realtime = 4,
    Completed = 5,
    Failed = 6,
}
impl RoundState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundState::Completed | RoundState::Failed)
    }
}

/// Everything the client learns about a round from gateways. Once observed for a given
///  update ID, a round's info does not change.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RoundInfo {
    pub id: RoundId,
    pub update_id: u64,
    pub state: RoundState,
    /// node IDs in mixing order
    pub topology: Vec<Id>,
    /// nanos since epoch, indexed by [RoundState]; 0 for states not reached (yet)
    pub timestamps: [u64; NUM_ROUND_STATES],
    pub address_space_size: u8,
    pub batch_size: u32,
    pub errors: Vec<String>,
}

impl RoundInfo {
    pub fn timestamp(&self, state: RoundState) -> Option<SystemTime> {
        match self.timestamps[u8::from(state) as usize] {
            0 => None,
            nanos => Some(UNIX_EPOCH + Duration::from_nanos(nanos)),
        }
    }

    /// For a queued round, the timestamp of the `Queued` state is the point in time at which the
    ///  realtime phase is scheduled to start.
    pub fn scheduled_realtime_start(&self) -> Option<SystemTime> {
        self.timestamp(RoundState::Queued)
    }

    /// checks if the realtime phase started already, or starts within `buffer` from `now`
    pub fn realtime_starts_within(&self, now: SystemTime, buffer: Duration) -> bool {
        match self.scheduled_realtime_start() {
            Some(start) => start <= now + buffer,
            None => true,
        }
    }

    /// time left until the realtime phase begins, zero if it started already
    pub fn time_until_realtime(&self, now: SystemTime) -> Duration {
        self.scheduled_realtime_start()
            .and_then(|start| start.duration_since(now).ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn first_gateway(&self) -> anyhow::Result<Id> {
        self.topology.first()
            .map(|n| n.to_gateway_id())
            .ok_or_else(|| anyhow!("round {} has an empty topology", self.id))
    }

    pub fn last_gateway(&self) -> anyhow::Result<Id> {
        self.topology.last()
            .map(|n| n.to_gateway_id())
            .ok_or_else(|| anyhow!("round {} has an empty topology", self.id))
    }

    /// the timestamp used to derive ephemeral IDs for this round
    pub fn ephemeral_timestamp(&self) -> SystemTime {
        self.timestamp(RoundState::Queued)
            .or_else(|| self.timestamp(RoundState::Realtime))
            .unwrap_or(UNIX_EPOCH)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.id);
        buf.put_u64(self.update_id);
        buf.put_u8(self.state.into());
        buf.put_usize_varint(self.topology.len());
        for node in &self.topology {
            node.ser(buf);
        }
        for ts in &self.timestamps {
            buf.put_u64(*ts);
        }
        buf.put_u8(self.address_space_size);
        buf.put_u32(self.batch_size);
        buf.put_usize_varint(self.errors.len());
        for e in &self.errors {
            put_string(buf, e);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RoundInfo> {
        let id = buf.try_get_u64()?;
        let update_id = buf.try_get_u64()?;
        let raw_state = buf.try_get_u8()?;
        let state = RoundState::try_from(raw_state)
            .map_err(|_| anyhow!("invalid round state {}", raw_state))?;

        let num_nodes = buf.try_get_usize_varint()?;
        if num_nodes > buf.remaining() {
            bail!("topology length {} exceeds buffer", num_nodes);
        }
        let mut topology = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            topology.push(Id::try_deser(buf)?);
        }

        let mut timestamps = [0u64; NUM_ROUND_STATES];
        for ts in timestamps.iter_mut() {
            *ts = buf.try_get_u64()?;
        }

        let address_space_size = buf.try_get_u8()?;
        let batch_size = buf.try_get_u32()?;

        let num_errors = buf.try_get_usize_varint()?;
        let mut errors = Vec::new();
        for _ in 0..num_errors {
            errors.push(try_get_string(buf)?);
        }

        Ok(RoundInfo {
            id,
            update_id,
            state,
            topology,
            timestamps,
            address_space_size,
            batch_size,
            errors,
        })
    }
}

pub fn to_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
