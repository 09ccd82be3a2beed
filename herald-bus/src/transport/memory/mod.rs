pub mod storage;

pub use storage::{MemoryTransport, MAX_DELIVERY_REASON, TTL_EXPIRED_REASON};
