pub mod pool;

pub use pool::{PoolConfig, PoolLoad, PoolManager};
