use crate::primitives::id::{Id, IdType, ID_DATA_LEN};
use crate::primitives::ndf::{GatewayInfo, Ndf, NodeInfo, NodeStatus};

/// convenience method for unit test code: create an [Id] based on a number, the same number
///  generating the same ID and different numbers different IDs
pub fn test_id_from_number(number: u16, id_type: IdType) -> Id {
    let mut data = [0u8; ID_DATA_LEN];
    data[..2].copy_from_slice(&number.to_be_bytes());
    Id::new(data, id_type)
}

pub fn test_gateway_id(number: u16) -> Id {
    test_id_from_number(number, IdType::Gateway)
}

pub fn test_node_id(number: u16) -> Id {
    test_id_from_number(number, IdType::Node)
}

pub fn test_gateway(number: u16) -> GatewayInfo {
    GatewayInfo {
        id: test_gateway_id(number),
        address: format!("gateway-{}.test:8443", number),
        tls_certificate: format!("cert-{}", number),
    }
}

/// an NDF with one gateway per number, each with an active node behind it
pub fn test_ndf(numbers: &[u16]) -> Ndf {
    Ndf {
        gateways: numbers.iter().map(|&n| test_gateway(n)).collect(),
        nodes: numbers.iter()
            .map(|&n| NodeInfo {
                id: test_node_id(n),
                status: NodeStatus::Active,
            })
            .collect(),
    }
}
