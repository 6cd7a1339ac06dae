use std::time::SystemTime;

use crate::identity::identity_tracker::ReceptionIdentity;
use crate::primitives::ephemeral::EphemeralId;
use crate::primitives::id::{Id, IdType};
use crate::test_util::ndf::test_id_from_number;

pub fn test_user_id(number: u16) -> Id {
    test_id_from_number(number, IdType::User)
}

/// a reception identity for [test_user_id] with the ephemeral ID currently valid
pub fn test_identity(number: u16) -> ReceptionIdentity {
    let source = test_user_id(number);
    ReceptionIdentity {
        source,
        address_space_size: 16,
        ephemeral: EphemeralId::derive(&source, 16, SystemTime::now())
            .expect("address space size 16 is valid"),
    }
}
