use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::{FxHashMap, FxHashSet};
use sha2::{Digest, Sha256};

use crate::primitives::id::Id;
use crate::util::buf::{put_string, try_get_string};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum NodeStatus {
    Active = 0,
    /// the node is listed, but has not participated in rounds for a while
    Stale = 1,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GatewayInfo {
    pub id: Id,
    pub address: String,
    pub tls_certificate: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NodeInfo {
    pub id: Id,
    pub status: NodeStatus,
}

/// The client's view of the network definition: the gateways it may talk to and the nodes behind
///  them. Only the parts relevant to the network engine are represented; parsing and signature
///  verification happen elsewhere.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Ndf {
    pub gateways: Vec<GatewayInfo>,
    pub nodes: Vec<NodeInfo>,
}

/// Difference between two NDFs in terms of gateway IDs
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NdfDiff {
    pub added: Vec<GatewayInfo>,
    pub removed: Vec<Id>,
}
impl NdfDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl Ndf {
    pub fn gateway_ids(&self) -> FxHashSet<Id> {
        self.gateways.iter().map(|g| g.id).collect()
    }

    pub fn gateway(&self, id: &Id) -> Option<&GatewayInfo> {
        self.gateways.iter().find(|g| &g.id == id)
    }

    /// the status of the node operating a gateway; gateways without a listed node count as stale
    pub fn node_status_for_gateway(&self, gateway_id: &Id) -> NodeStatus {
        let node_id = gateway_id.to_node_id();
        self.nodes.iter()
            .find(|n| n.id == node_id)
            .map(|n| n.status)
            .unwrap_or(NodeStatus::Stale)
    }

    pub fn is_gateway_stale(&self, gateway_id: &Id) -> bool {
        self.node_status_for_gateway(gateway_id) == NodeStatus::Stale
    }

    pub fn diff(&self, newer: &Ndf) -> NdfDiff {
        let old_ids = self.gateway_ids();
        let new_ids = newer.gateway_ids();

        let added = newer.gateways.iter()
            .filter(|g| !old_ids.contains(&g.id))
            .cloned()
            .collect();
        let removed = self.gateways.iter()
            .filter(|g| !new_ids.contains(&g.id))
            .map(|g| g.id)
            .collect();

        NdfDiff { added, removed }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.gateways.len());
        for g in &self.gateways {
            g.id.ser(buf);
            put_string(buf, &g.address);
            put_string(buf, &g.tls_certificate);
        }
        buf.put_usize_varint(self.nodes.len());
        for n in &self.nodes {
            n.id.ser(buf);
            buf.put_u8(n.status.into());
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Ndf> {
        let num_gateways = buf.try_get_usize_varint()?;
        let mut gateways = Vec::new();
        for _ in 0..num_gateways {
            gateways.push(GatewayInfo {
                id: Id::try_deser(buf)?,
                address: try_get_string(buf)?,
                tls_certificate: try_get_string(buf)?,
            });
        }

        let num_nodes = buf.try_get_usize_varint()?;
        let mut nodes = Vec::new();
        for _ in 0..num_nodes {
            let id = Id::try_deser(buf)?;
            let raw_status = buf.try_get_u8()?;
            let status = NodeStatus::try_from(raw_status)
                .map_err(|_| anyhow!("invalid node status {}", raw_status))?;
            nodes.push(NodeInfo { id, status });
        }

        Ok(Ndf { gateways, nodes })
    }

    /// Hash over the canonical serialization. Clients send it with every poll so the gateway only
    ///  returns an NDF when it differs.
    pub fn partial_hash(&self) -> [u8; 32] {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        Sha256::digest(&buf).into()
    }

    /// lookup table gateway ID -> index in [Ndf::gateways]
    pub fn gateway_index(&self) -> FxHashMap<Id, usize> {
        self.gateways.iter()
            .enumerate()
            .map(|(i, g)| (g.id, i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::ndf::{test_ndf, test_gateway_id};
    use super::*;

    #[test]
    fn test_diff() {
        let old = test_ndf(&[1, 2, 3]);
        let new = test_ndf(&[2, 3, 4, 5]);

        let diff = old.diff(&new);
        assert_eq!(diff.added.iter().map(|g| g.id).collect::<Vec<_>>(), vec![test_gateway_id(4), test_gateway_id(5)]);
        assert_eq!(diff.removed, vec![test_gateway_id(1)]);
        assert!(!diff.is_empty());

        assert!(new.diff(&new).is_empty());
    }

    #[test]
    fn test_stale() {
        let mut ndf = test_ndf(&[1, 2]);
        ndf.nodes[1].status = NodeStatus::Stale;

        assert!(!ndf.is_gateway_stale(&test_gateway_id(1)));
        assert!(ndf.is_gateway_stale(&test_gateway_id(2)));
        assert!(ndf.is_gateway_stale(&test_gateway_id(3)));
    }

    #[test]
    fn test_partial_hash() {
        let a = test_ndf(&[1, 2]);
        let b = test_ndf(&[1, 2]);
        let c = test_ndf(&[1, 3]);
        assert_eq!(a.partial_hash(), b.partial_hash());
        assert_ne!(a.partial_hash(), c.partial_hash());
    }

    #[test]
    fn test_ser_deser() {
        let ndf = test_ndf(&[1, 2, 3]);
        let mut buf = BytesMut::new();
        ndf.ser(&mut buf);
        let mut b: &[u8] = &buf;
        assert_eq!(Ndf::try_deser(&mut b).unwrap(), ndf);
    }
}
