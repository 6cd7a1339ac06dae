use std::fmt::Debug;
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::primitives::round::to_nanos;
use crate::util::buf::{put_bytes, try_get_bytes};

const CRC: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_REDIS);

/// A stored record: the payload is opaque to the store, the version lets the owner of a record
///  migrate its encoding.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VersionedObject {
    pub version: u64,
    /// nanos since epoch at the time of storing
    pub timestamp: u64,
    pub data: Bytes,
}

impl VersionedObject {
    pub fn new(version: u64, data: impl Into<Bytes>) -> VersionedObject {
        VersionedObject {
            version,
            timestamp: to_nanos(SystemTime::now()),
            data: data.into(),
        }
    }

    fn checksum(version: u64, timestamp: u64, data: &[u8]) -> u64 {
        let mut digest = CRC.digest();
        digest.update(&version.to_le_bytes());
        digest.update(&timestamp.to_le_bytes());
        digest.update(data);
        digest.finalize()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.version);
        buf.put_u64(self.timestamp);
        put_bytes(buf, &self.data);
        buf.put_u64(Self::checksum(self.version, self.timestamp, &self.data));
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<VersionedObject> {
        let version = buf.try_get_u64()?;
        let timestamp = buf.try_get_u64()?;
        let data = try_get_bytes(buf)?;
        let checksum = buf.try_get_u64()?;

        if checksum != Self::checksum(version, timestamp, &data) {
            bail!("checksum mismatch for stored object");
        }

        Ok(VersionedObject {
            version,
            timestamp,
            data: data.into(),
        })
    }

    /// fails unless the object has exactly the expected version
    pub fn expect_version(&self, key: &str, version: u64) -> anyhow::Result<&[u8]> {
        if self.version != version {
            bail!("unsupported version {} for {}, expected {}", self.version, key, version);
        }
        Ok(&self.data)
    }
}

/// Key-value persistence used for everything the engine needs to survive a restart. The actual
///  backing store is provided by the application.
pub trait KvStore: Debug + Send + Sync + 'static {
    fn get(&self, key: &str) -> anyhow::Result<Option<VersionedObject>>;
    fn set(&self, key: &str, object: VersionedObject) -> anyhow::Result<()>;
    fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// [KvStore] keeping serialized objects in memory, e.g. for tests or ephemeral sessions
#[derive(Debug, Default)]
pub struct MemStore {
    objects: Mutex<FxHashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        Default::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut result = self.objects.lock().unwrap()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<VersionedObject>> {
        let raw = self.objects.lock().unwrap()
            .get(key)
            .cloned();

        match raw {
            Some(raw) => {
                let mut buf: &[u8] = &raw;
                Ok(Some(VersionedObject::try_deser(&mut buf)?))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, object: VersionedObject) -> anyhow::Result<()> {
        trace!("storing {} ({} bytes)", key, object.data.len());
        let mut buf = BytesMut::new();
        object.ser(&mut buf);
        self.objects.lock().unwrap()
            .insert(key.to_string(), buf.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.objects.lock().unwrap()
            .remove(key);
        Ok(())
    }
}
