use std::sync::OnceLock;

use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};

use crate::util::buf::{put_bytes, put_string, try_get_bytes, try_get_string};

/// tag used for messages addressed to a recipient without a more specific service
pub const DEFAULT_SERVICE_TAG: &str = "default";

/// A named reception channel for an identity. Incoming messages carry an identity fingerprint over
///  the service's preimage; services stay registered across many messages, unlike fingerprints.
#[derive(Debug)]
pub struct Service {
    pub identifier: Vec<u8>,
    pub tag: String,
    pub source: Option<Vec<u8>>,
    preimage: OnceLock<[u8; 32]>,
}

impl Service {
    pub fn new(identifier: Vec<u8>, tag: impl Into<String>, source: Option<Vec<u8>>) -> Service {
        Service {
            identifier,
            tag: tag.into(),
            source,
            preimage: OnceLock::new(),
        }
    }

    /// computed on first use and cached
    pub fn preimage(&self) -> &[u8; 32] {
        self.preimage.get_or_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(&self.identifier);
            hasher.update(self.tag.as_bytes());
            hasher.finalize().into()
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        put_bytes(buf, &self.identifier);
        put_string(buf, &self.tag);
        match &self.source {
            Some(s) => {
                buf.put_u8(1);
                put_bytes(buf, s);
            }
            None => buf.put_u8(0),
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Service> {
        let identifier = try_get_bytes(buf)?;
        let tag = try_get_string(buf)?;
        let source = match buf.try_get_u8()? {
            0 => None,
            _ => Some(try_get_bytes(buf)?),
        };
        Ok(Service::new(identifier, tag, source))
    }
}

impl Clone for Service {
    fn clone(&self) -> Self {
        Service {
            identifier: self.identifier.clone(),
            tag: self.tag.clone(),
            source: self.source.clone(),
            preimage: self.preimage.clone(),
        }
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.tag == other.tag && self.source == other.source
    }
}
impl Eq for Service {}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use super::*;

    #[test]
    fn test_preimage_cached_and_distinct() {
        let a = Service::new(b"id".to_vec(), "e2e", None);
        let b = Service::new(b"id".to_vec(), "group", None);

        let first = *a.preimage();
        assert_eq!(a.preimage(), &first);
        assert_ne!(a.preimage(), b.preimage());
    }

    #[test]
    fn test_ser_deser() {
        let service = Service::new(b"id".to_vec(), "notifications", Some(b"src".to_vec()));
        let mut buf = BytesMut::new();
        service.ser(&mut buf);
        let mut b: &[u8] = &buf;
        assert_eq!(Service::try_deser(&mut b).unwrap(), service);
    }
}
