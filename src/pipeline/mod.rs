pub mod pool;

pub use pool::{FramePool, Plane, PoolError, PoolStats, PooledFrame};
