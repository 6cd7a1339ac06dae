use sha2::{Digest, Sha256};

use crate::primitives::id::Id;
use crate::primitives::message::MAC_LEN;

pub const KEY_LEN: usize = 32;
pub type NodeKey = [u8; KEY_LEN];

/// The cryptographic operations the network engine needs. The actual cMix group arithmetic lives
///  elsewhere; the engine only needs to be able to derive node keys, encrypt a payload in layers
///  and authenticate it.
#[cfg_attr(test, mockall::automock)]
pub trait MixCrypto: Send + Sync + 'static {
    /// the public key sent to nodes when requesting key material
    fn client_public_key(&self) -> [u8; 32];

    fn derive_node_key(&self, node_id: &Id, key_material: &[u8]) -> NodeKey;

    /// encrypts a payload with every node key, in mixing order
    fn encrypt(&self, payload: &[u8], keys: &[NodeKey], salt: &[u8; 32]) -> Vec<u8>;

    /// one MAC per node key, proving the sender holds the key
    fn kmacs(&self, payload: &[u8], keys: &[NodeKey], salt: &[u8; 32]) -> Vec<[u8; MAC_LEN]>;

    /// authenticates a request towards the first gateway of a round
    fn gateway_mac(&self, gateway_key: &NodeKey, payload: &[u8]) -> [u8; MAC_LEN];
}

/// Keystream based reference implementation built on SHA-256. Encryption is an involution, which
///  makes it easy to verify in tests and in local test networks.
pub struct Sha256MixCrypto {
    public_key: [u8; 32],
    secret: [u8; 32],
}

impl Sha256MixCrypto {
    pub fn new(secret: [u8; 32]) -> Sha256MixCrypto {
        let public_key = Sha256::new()
            .chain_update(b"public")
            .chain_update(secret)
            .finalize()
            .into();
        Sha256MixCrypto { public_key, secret }
    }

    fn apply_keystream(data: &mut [u8], key: &NodeKey, salt: &[u8; 32]) {
        for (counter, chunk) in data.chunks_mut(32).enumerate() {
            let block: [u8; 32] = Sha256::new()
                .chain_update(key)
                .chain_update(salt)
                .chain_update((counter as u64).to_be_bytes())
                .finalize()
                .into();
            for (d, k) in chunk.iter_mut().zip(block.iter()) {
                *d ^= k;
            }
        }
    }

    /// reverses [MixCrypto::encrypt]
    pub fn decrypt(&self, payload: &[u8], keys: &[NodeKey], salt: &[u8; 32]) -> Vec<u8> {
        self.encrypt(payload, keys, salt)
    }
}

impl MixCrypto for Sha256MixCrypto {
    fn client_public_key(&self) -> [u8; 32] {
        self.public_key
    }

    fn derive_node_key(&self, node_id: &Id, key_material: &[u8]) -> NodeKey {
        Sha256::new()
            .chain_update(self.secret)
            .chain_update(node_id.as_bytes())
            .chain_update(key_material)
            .finalize()
            .into()
    }

    fn encrypt(&self, payload: &[u8], keys: &[NodeKey], salt: &[u8; 32]) -> Vec<u8> {
        let mut result = payload.to_vec();
        for key in keys {
            Self::apply_keystream(&mut result, key, salt);
        }
        result
    }

    fn kmacs(&self, payload: &[u8], keys: &[NodeKey], salt: &[u8; 32]) -> Vec<[u8; MAC_LEN]> {
        let digest = Sha256::digest(payload);
        keys.iter()
            .map(|key| Sha256::new()
                .chain_update(key)
                .chain_update(salt)
                .chain_update(digest)
                .finalize()
                .into())
            .collect()
    }

    fn gateway_mac(&self, gateway_key: &NodeKey, payload: &[u8]) -> [u8; MAC_LEN] {
        Sha256::new()
            .chain_update(b"gateway")
            .chain_update(gateway_key)
            .chain_update(Sha256::digest(payload))
            .finalize()
            .into()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::ndf::test_node_id;
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let crypto = Sha256MixCrypto::new([3u8; 32]);
        let keys = [[1u8; 32], [2u8; 32], [7u8; 32]];
        let salt = [9u8; 32];
        let payload = b"a payload that is longer than a single keystream block".to_vec();

        let encrypted = crypto.encrypt(&payload, &keys, &salt);
        assert_ne!(encrypted, payload);
        assert_eq!(crypto.decrypt(&encrypted, &keys, &salt), payload);
    }

    #[test]
    fn test_derive_node_key() {
        let crypto = Sha256MixCrypto::new([3u8; 32]);
        let a = crypto.derive_node_key(&test_node_id(1), b"material");
        assert_eq!(a, crypto.derive_node_key(&test_node_id(1), b"material"));
        assert_ne!(a, crypto.derive_node_key(&test_node_id(2), b"material"));
        assert_ne!(a, Sha256MixCrypto::new([4u8; 32]).derive_node_key(&test_node_id(1), b"material"));
    }

    #[test]
    fn test_kmacs() {
        let crypto = Sha256MixCrypto::new([3u8; 32]);
        let kmacs = crypto.kmacs(b"payload", &[[1u8; 32], [2u8; 32]], &[0u8; 32]);
        assert_eq!(kmacs.len(), 2);
        assert_ne!(kmacs[0], kmacs[1]);
    }
}
