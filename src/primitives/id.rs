use std::fmt::{Debug, Display, Formatter};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use sha2::{Digest, Sha256};

use crate::util::buf::try_get_array;

pub const ID_DATA_LEN: usize = 32;
pub const ID_LEN: usize = ID_DATA_LEN + 1;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum IdType {
    Generic = 0,
    Gateway = 1,
    Node = 2,
    User = 3,
}

/// Identifies users, nodes and gateways on the network: 32 bytes of identifying data followed by
///  a type byte. A node and its gateway share the same data and differ only in the type byte.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    pub fn new(data: [u8; ID_DATA_LEN], id_type: IdType) -> Id {
        let mut raw = [0u8; ID_LEN];
        raw[..ID_DATA_LEN].copy_from_slice(&data);
        raw[ID_DATA_LEN] = id_type.into();
        Id(raw)
    }

    /// derives an ID by hashing arbitrary seed material, e.g. a public key
    pub fn from_seed(seed: &[u8], id_type: IdType) -> Id {
        let data: [u8; ID_DATA_LEN] = Sha256::digest(seed).into();
        Id::new(data, id_type)
    }

    pub fn data(&self) -> &[u8] {
        &self.0[..ID_DATA_LEN]
    }

    pub fn id_type(&self) -> anyhow::Result<IdType> {
        IdType::try_from(self.0[ID_DATA_LEN])
            .map_err(|_| anyhow!("invalid id type {}", self.0[ID_DATA_LEN]))
    }

    pub fn with_type(&self, id_type: IdType) -> Id {
        let mut raw = self.0;
        raw[ID_DATA_LEN] = id_type.into();
        Id(raw)
    }

    pub fn to_gateway_id(&self) -> Id {
        self.with_type(IdType::Gateway)
    }

    pub fn to_node_id(&self) -> Id {
        self.with_type(IdType::Node)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Id> {
        Ok(Id(try_get_array(buf)?))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..:{})", self.0[ID_DATA_LEN])
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
