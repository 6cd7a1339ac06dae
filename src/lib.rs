pub mod cmix;
pub mod critical;
pub mod crypto;
pub mod dispatch;
pub mod follow;
pub mod gateway;
pub mod health;
pub mod identity;
pub mod network;
pub mod nodes;
pub mod primitives;
pub mod rounds;
pub mod storage;
pub mod util;
pub mod test_util;
